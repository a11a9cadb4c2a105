use std::sync::Arc;

use presence::PresenceConnector;
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::StoreChange,
};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
mod local_gateway;
pub mod presence_tracker;
pub mod receipts;
mod remote_gateway;
pub mod send_pipeline;
pub mod synchronizer;

pub use config::EngineSettings;
pub use error::ChatError;
pub use gateway::{
    BlobUploader, ChangeSubscription, MissingBlobUploader, MissingPresenceConnector,
    MissingStoreGateway, StoreGateway,
};
pub use local_gateway::LocalStoreGateway;
pub use presence_tracker::PresenceEntry;
pub use receipts::SeenByEntry;
pub use remote_gateway::RestStoreGateway;
pub use send_pipeline::{ImageAttachment, SendOutcome};
pub use synchronizer::{DeliveryState, Message, SenderIdentity};

use directory::SenderDirectory;
use presence_tracker::PresenceTracker;
use receipts::ReadReceiptTracker;
use send_pipeline::SendPipeline;
use synchronizer::{load_history, InsertOutcome, MessageSynchronizer, SyncHandle};

/// Authenticated identity every operation runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSession {
    pub viewer_id: UserId,
    pub display_name: String,
    pub photo_url: Option<String>,
}

impl ViewerSession {
    pub fn new(viewer_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            display_name: display_name.into(),
            photo_url: None,
        }
    }

    pub fn identity(&self) -> SenderIdentity {
        SenderIdentity {
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ChannelOpened {
        channel_id: ChannelId,
    },
    ChannelClosed {
        channel_id: ChannelId,
    },
    MessagesChanged {
        channel_id: ChannelId,
        messages: Vec<Message>,
    },
    PresenceChanged {
        channel_id: ChannelId,
        online: Vec<PresenceEntry>,
    },
    /// Transient user-facing notification.
    Notice(ChatError),
}

pub struct ChatClient {
    gateway: Arc<dyn StoreGateway>,
    presence: Arc<dyn PresenceConnector>,
    directory: Arc<SenderDirectory>,
    pipeline: SendPipeline,
    active: Mutex<Option<ActiveChannel>>,
    events: broadcast::Sender<ChatEvent>,
}

struct ActiveChannel {
    context: ChannelContext,
    presence: PresenceTracker,
    feed: Option<FeedWorker>,
}

#[derive(Clone)]
struct ChannelContext {
    session: ViewerSession,
    channel_id: ChannelId,
    sync: SyncHandle,
    receipts: Arc<ReadReceiptTracker>,
}

struct FeedWorker {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ChatClient {
    pub fn new(gateway: Arc<dyn StoreGateway>, settings: EngineSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            gateway,
            Arc::new(MissingBlobUploader),
            Arc::new(MissingPresenceConnector),
            settings,
        )
    }

    pub fn new_with_dependencies(
        gateway: Arc<dyn StoreGateway>,
        uploader: Arc<dyn BlobUploader>,
        presence: Arc<dyn PresenceConnector>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Arc::new(Self {
            pipeline: SendPipeline::new(Arc::clone(&gateway), uploader, &settings),
            directory: Arc::new(SenderDirectory::new(
                settings.fallback_display_name.clone(),
            )),
            gateway,
            presence,
            active: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Loads history, acknowledges it, then starts the live feed and presence.
    ///
    /// A failed history load leaves no channel open. A failed subscription or
    /// presence join leaves the channel open without live updates or
    /// presence respectively.
    pub async fn open_channel(
        &self,
        session: ViewerSession,
        channel_id: ChannelId,
    ) -> Result<(), ChatError> {
        self.close_channel().await;

        let history = match load_history(
            self.gateway.as_ref(),
            &self.directory,
            &session,
            &channel_id,
        )
        .await
        {
            Ok(history) => history,
            Err(err) => {
                error!(channel_id = %channel_id, "sync: history load failed: {err}");
                self.notify(err.clone());
                return Err(err);
            }
        };

        let sync = SyncHandle::new(
            MessageSynchronizer::new(channel_id.clone(), session.viewer_id.clone()),
            self.events.clone(),
        );
        sync.apply(|s| s.install_history(history)).await;

        let receipts = Arc::new(ReadReceiptTracker::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.directory),
        ));
        let loaded = sync.snapshot().await;
        let outcome = receipts.bulk_mark_read(&loaded, &session.viewer_id).await;
        debug!(
            channel_id = %channel_id,
            marked = outcome.marked,
            failed = outcome.failed,
            "receipts: history acknowledged"
        );

        let context = ChannelContext {
            session: session.clone(),
            channel_id: channel_id.clone(),
            sync,
            receipts,
        };

        let feed = match self.gateway.subscribe(&channel_id).await {
            Ok(subscription) => Some(self.spawn_feed(context.clone(), subscription)),
            Err(err) => {
                let err = ChatError::Subscription(err.to_string());
                warn!(channel_id = %channel_id, "sync: {err}");
                self.notify(err);
                None
            }
        };

        let mut presence = PresenceTracker::new(self.events.clone());
        if let Err(err) = presence
            .join(
                self.presence.as_ref(),
                &channel_id,
                &session.viewer_id,
                &session.display_name,
            )
            .await
        {
            warn!(channel_id = %channel_id, "presence: {err}");
            self.notify(err);
        }

        *self.active.lock().await = Some(ActiveChannel {
            context,
            presence,
            feed,
        });
        info!(
            channel_id = %channel_id,
            viewer_id = %session.viewer_id,
            "sync: channel opened"
        );
        let _ = self.events.send(ChatEvent::ChannelOpened { channel_id });
        Ok(())
    }

    /// Tears down the live feed and presence of the open channel, if any.
    pub async fn close_channel(&self) {
        let Some(mut active) = self.active.lock().await.take() else {
            return;
        };
        if let Some(feed) = active.feed.take() {
            let _ = feed.stop.send(());
            if let Err(err) = feed.task.await {
                warn!(channel_id = %active.context.channel_id, "sync: feed task ended abnormally: {err}");
            }
        }
        active.presence.leave().await;
        info!(channel_id = %active.context.channel_id, "sync: channel closed");
        let _ = self.events.send(ChatEvent::ChannelClosed {
            channel_id: active.context.channel_id,
        });
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.context.channel_id.clone())
    }

    pub async fn messages(&self) -> Vec<Message> {
        match self.context().await {
            Ok(context) => context.sync.snapshot().await,
            Err(_) => Vec::new(),
        }
    }

    pub async fn send_message(
        &self,
        text: &str,
        image: Option<ImageAttachment>,
    ) -> Result<SendOutcome, ChatError> {
        let context = self.context().await?;
        let result = self
            .pipeline
            .send(&context.session, &context.sync, text, image)
            .await;
        if let Err(err) = &result {
            self.notify(err.clone());
        }
        result
    }

    pub async fn edit_message(&self, message_id: &MessageId, text: &str) -> Result<(), ChatError> {
        let context = self.context().await?;
        let result = self.edit_in(&context, message_id, text).await;
        if let Err(err) = &result {
            self.notify(err.clone());
        }
        result
    }

    async fn edit_in(
        &self,
        context: &ChannelContext,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), ChatError> {
        if message_id.is_temp() {
            return Err(ChatError::NotConfirmed(message_id.clone()));
        }
        ensure_own(context, message_id).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyText);
        }
        self.gateway
            .update_message_text(message_id, text)
            .await
            .map_err(|err| ChatError::Send(err.to_string()))?;
        context.sync.apply(|s| s.apply_edit(message_id, text)).await;
        info!(channel_id = %context.channel_id, message_id = %message_id, "sync: message edited");
        Ok(())
    }

    /// Deleting an unconfirmed message is local until its write lands.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), ChatError> {
        let context = self.context().await?;
        if let Err(err) = ensure_own(&context, message_id).await {
            self.notify(err.clone());
            return Err(err);
        }
        if message_id.is_temp() {
            let written = context.sync.apply(|s| s.delete_pending(message_id)).await;
            if let Some(stored_id) = written {
                if let Err(err) = self.gateway.delete_message(&stored_id).await {
                    warn!(channel_id = %context.channel_id, message_id = %stored_id, "sync: remote delete failed: {err}");
                }
            }
        } else {
            if let Err(err) = self.gateway.delete_message(message_id).await {
                let err = ChatError::Send(err.to_string());
                warn!(channel_id = %context.channel_id, message_id = %message_id, "sync: delete failed: {err}");
                self.notify(err.clone());
                return Err(err);
            }
            context.sync.apply(|s| s.apply_delete(message_id)).await;
        }
        info!(channel_id = %context.channel_id, message_id = %message_id, "sync: message deleted");
        Ok(())
    }

    /// Other users viewing the open channel.
    pub async fn online_users(&self) -> Vec<PresenceEntry> {
        match self.active.lock().await.as_ref() {
            Some(active) => active.presence.other_online_users().await,
            None => Vec::new(),
        }
    }

    /// Number of other users viewing the open channel.
    pub async fn online_count(&self) -> usize {
        match self.active.lock().await.as_ref() {
            Some(active) => active.presence.online_count().await,
            None => 0,
        }
    }

    pub async fn open_seen_by(&self, message_id: &MessageId) -> Result<Vec<SeenByEntry>, ChatError> {
        let context = self.context().await?;
        let result = context.receipts.seen_by(message_id, &context.session).await;
        if let Err(err) = &result {
            self.notify(err.clone());
        }
        result
    }

    async fn context(&self) -> Result<ChannelContext, ChatError> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.context.clone())
            .ok_or(ChatError::NoActiveChannel)
    }

    fn notify(&self, err: ChatError) {
        if err.is_user_visible() {
            let _ = self.events.send(ChatEvent::Notice(err));
        }
    }

    fn spawn_feed(
        &self,
        context: ChannelContext,
        mut subscription: Box<dyn ChangeSubscription>,
    ) -> FeedWorker {
        let (stop, mut stopped) = oneshot::channel();
        let gateway = Arc::clone(&self.gateway);
        let directory = Arc::clone(&self.directory);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => {
                        subscription.unsubscribe().await;
                        debug!(channel_id = %context.channel_id, "sync: change feed released");
                        return;
                    }
                    change = subscription.next_change() => match change {
                        Some(Ok(change)) => {
                            apply_change(gateway.as_ref(), &directory, &context, change).await;
                        }
                        Some(Err(err)) => {
                            let err = ChatError::Subscription(err.to_string());
                            warn!(channel_id = %context.channel_id, "sync: {err}");
                            let _ = events.send(ChatEvent::Notice(err));
                            break;
                        }
                        None => {
                            let err = ChatError::Subscription("change feed closed by the store".into());
                            warn!(channel_id = %context.channel_id, "sync: {err}");
                            let _ = events.send(ChatEvent::Notice(err));
                            break;
                        }
                    }
                }
            }
            subscription.unsubscribe().await;
        });
        FeedWorker { stop, task }
    }
}

/// Only the viewer's own messages may be edited or deleted.
async fn ensure_own(context: &ChannelContext, message_id: &MessageId) -> Result<(), ChatError> {
    let own = context
        .sync
        .apply(|s| s.get(message_id).map(|m| m.is_own_message))
        .await;
    match own {
        Some(true) => Ok(()),
        Some(false) => Err(ChatError::NotOwnMessage(message_id.clone())),
        None => Err(ChatError::UnknownMessage(message_id.clone())),
    }
}

async fn apply_change(
    gateway: &dyn StoreGateway,
    directory: &SenderDirectory,
    context: &ChannelContext,
    change: StoreChange,
) {
    let channel_id = &context.channel_id;
    match change {
        StoreChange::MessageInserted { message } => {
            let sender = directory
                .resolve(gateway, &context.session, &message.sender_id)
                .await;
            let outcome = context
                .sync
                .apply(|s| s.apply_remote_insert(message, sender))
                .await;
            match outcome {
                InsertOutcome::Reconciled {
                    temp_id,
                    message_id,
                } => {
                    debug!(channel_id = %channel_id, temp_id = %temp_id, message_id = %message_id, "sync: reconciled pending message");
                }
                InsertOutcome::AppendedOwn { message_id } => {
                    debug!(channel_id = %channel_id, message_id = %message_id, "sync: appended own message");
                }
                InsertOutcome::AppendedForeign { message_id } => {
                    let message = context
                        .sync
                        .apply(|s| s.get(&message_id).cloned())
                        .await;
                    if let Some(message) = message {
                        if let Err(err) = context
                            .receipts
                            .acknowledge(&message, &context.session.viewer_id)
                            .await
                        {
                            warn!(channel_id = %channel_id, message_id = %message_id, "receipts: {err}");
                        }
                    }
                }
                InsertOutcome::Duplicate { message_id } => {
                    debug!(channel_id = %channel_id, message_id = %message_id, "sync: duplicate insert ignored");
                }
                InsertOutcome::Abandoned { message_id } => {
                    info!(channel_id = %channel_id, message_id = %message_id, "sync: removing message deleted before confirmation");
                    if let Err(err) = gateway.delete_message(&message_id).await {
                        warn!(channel_id = %channel_id, message_id = %message_id, "sync: remote delete failed: {err}");
                    }
                }
                InsertOutcome::OtherChannel => {}
            }
        }
        StoreChange::MessageUpdated { message } => {
            if let Some(text) = message.text.as_deref() {
                context.sync.apply(|s| s.apply_edit(&message.id, text)).await;
            }
        }
        StoreChange::MessageDeleted { message_id, .. } => {
            context.sync.apply(|s| s.apply_delete(&message_id)).await;
        }
        StoreChange::ReadReceiptInserted { receipt, .. } => {
            context
                .sync
                .apply(|s| s.apply_read_receipt(&receipt.message_id, &receipt.user_id))
                .await;
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
