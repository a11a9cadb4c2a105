use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, MessageId, UserId};

/// A message row as stored and as echoed back by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Client-generated correlation id, echoed unchanged by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptRow {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileLookupRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobUploadResponse {
    pub url: String,
}

/// Change notifications published by the store, scoped to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StoreChange {
    MessageInserted {
        message: MessageRow,
    },
    MessageUpdated {
        message: MessageRow,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    ReadReceiptInserted {
        channel_id: ChannelId,
        receipt: ReadReceiptRow,
    },
}

impl StoreChange {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            StoreChange::MessageInserted { message } | StoreChange::MessageUpdated { message } => {
                &message.channel_id
            }
            StoreChange::MessageDeleted { channel_id, .. }
            | StoreChange::ReadReceiptInserted { channel_id, .. } => channel_id,
        }
    }
}
