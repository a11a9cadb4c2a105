use shared::domain::MessageId;
use thiserror::Error;

/// Failures surfaced by the chat engine.
///
/// Every store, upload and presence failure is caught where the call is made
/// and turned into one of these; none of them leaves local state with an
/// orphaned optimistic entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("failed to send message: {0}")]
    Send(String),
    #[error("failed to upload image: {0}")]
    Upload(String),
    #[error("image is {size} bytes; the limit is {limit} bytes")]
    ImageTooLarge { size: usize, limit: usize },
    #[error("live updates unavailable: {0}")]
    Subscription(String),
    #[error("presence unavailable: {0}")]
    Presence(String),
    #[error("failed to record read receipt: {0}")]
    Acknowledge(String),
    #[error("message {0} is not confirmed yet")]
    NotConfirmed(MessageId),
    #[error("message {0} was sent by someone else")]
    NotOwnMessage(MessageId),
    #[error("message {0} is not in this channel")]
    UnknownMessage(MessageId),
    #[error("message text must not be empty")]
    EmptyText,
    #[error("no channel is open")]
    NoActiveChannel,
}

impl ChatError {
    /// Presence and read-receipt failures degrade silently; everything else
    /// is shown to the user as a transient notification.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, ChatError::Presence(_) | ChatError::Acknowledge(_))
    }
}
