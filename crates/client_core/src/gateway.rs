//! Seams to the remote store, blob storage and presence layer.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use presence::{PresenceChannel, PresenceConnector, PresenceJoinOptions};
use shared::{
    domain::{ChannelId, MessageId, UserId, UserProfile},
    protocol::{MessageRow, NewMessage, ReadReceiptRow, StoreChange},
};

#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Messages of a channel ordered by `created_at` ascending.
    async fn fetch_messages(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>>;
    async fn fetch_read_receipts(&self, message_id: &MessageId) -> Result<Vec<ReadReceiptRow>>;
    async fn fetch_channel_read_receipts(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ReadReceiptRow>>;
    async fn fetch_profiles(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>>;
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow>;
    async fn update_message_text(&self, message_id: &MessageId, text: &str) -> Result<()>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;
    /// Idempotent on (message, user).
    async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<ReadReceiptRow>;
    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Box<dyn ChangeSubscription>>;
}

/// Live change feed for one channel.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// `None` once the feed is closed; `Some(Err(_))` when it dropped.
    async fn next_change(&mut self) -> Option<Result<StoreChange>>;
    async fn unsubscribe(self: Box<Self>);
}

#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Stores an image under a channel-scoped path and returns its public URL.
    async fn upload_image(
        &self,
        channel_id: &ChannelId,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String>;
}

pub struct MissingStoreGateway;

#[async_trait]
impl StoreGateway for MissingStoreGateway {
    async fn fetch_messages(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        Err(anyhow!("store unavailable for channel {channel_id}"))
    }

    async fn fetch_read_receipts(&self, message_id: &MessageId) -> Result<Vec<ReadReceiptRow>> {
        Err(anyhow!("store unavailable for message {message_id}"))
    }

    async fn fetch_channel_read_receipts(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ReadReceiptRow>> {
        Err(anyhow!("store unavailable for channel {channel_id}"))
    }

    async fn fetch_profiles(&self, _user_ids: &[UserId]) -> Result<Vec<UserProfile>> {
        Err(anyhow!("store unavailable"))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        Err(anyhow!("store unavailable for channel {}", message.channel_id))
    }

    async fn update_message_text(&self, message_id: &MessageId, _text: &str) -> Result<()> {
        Err(anyhow!("store unavailable for message {message_id}"))
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        Err(anyhow!("store unavailable for message {message_id}"))
    }

    async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        _user_id: &UserId,
    ) -> Result<ReadReceiptRow> {
        Err(anyhow!("store unavailable for message {message_id}"))
    }

    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Box<dyn ChangeSubscription>> {
        Err(anyhow!("change feed unavailable for channel {channel_id}"))
    }
}

pub struct MissingBlobUploader;

#[async_trait]
impl BlobUploader for MissingBlobUploader {
    async fn upload_image(
        &self,
        _channel_id: &ChannelId,
        _file_name: &str,
        _content_type: Option<&str>,
        _bytes: Vec<u8>,
    ) -> Result<String> {
        Err(anyhow!("blob storage is unavailable"))
    }
}

pub struct MissingPresenceConnector;

#[async_trait]
impl PresenceConnector for MissingPresenceConnector {
    async fn join(&self, options: PresenceJoinOptions) -> Result<Arc<dyn PresenceChannel>> {
        Err(anyhow!("presence layer unavailable for topic {}", options.topic))
    }
}
