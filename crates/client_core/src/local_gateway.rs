use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{ChannelId, MessageId, UserId, UserProfile},
    protocol::{MessageRow, NewMessage, ReadReceiptRow, StoreChange},
};
use storage::Storage;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::debug;

use crate::gateway::{BlobUploader, ChangeSubscription, StoreGateway};

/// Store gateway backed by the in-process SQLite store.
#[derive(Clone)]
pub struct LocalStoreGateway {
    store: Storage,
    image_bucket: String,
}

impl LocalStoreGateway {
    pub async fn initialize(database_url: &str, image_bucket: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url).await?;
        Ok(Arc::new(Self::new(store, image_bucket)))
    }

    pub fn new(store: Storage, image_bucket: impl Into<String>) -> Self {
        Self {
            store,
            image_bucket: image_bucket.into(),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.store
    }
}

#[async_trait]
impl StoreGateway for LocalStoreGateway {
    async fn fetch_messages(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        self.store.list_channel_messages(channel_id).await
    }

    async fn fetch_read_receipts(&self, message_id: &MessageId) -> Result<Vec<ReadReceiptRow>> {
        self.store.list_read_receipts(message_id).await
    }

    async fn fetch_channel_read_receipts(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ReadReceiptRow>> {
        self.store.list_channel_read_receipts(channel_id).await
    }

    async fn fetch_profiles(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>> {
        self.store.load_profiles(user_ids).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        self.store.insert_message(&message).await
    }

    async fn update_message_text(&self, message_id: &MessageId, text: &str) -> Result<()> {
        if self.store.update_message_text(message_id, text).await? {
            Ok(())
        } else {
            Err(anyhow!("message {message_id} does not exist"))
        }
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        if !self.store.delete_message(message_id).await? {
            debug!(message_id = %message_id, "gateway: delete of missing message ignored");
        }
        Ok(())
    }

    async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<ReadReceiptRow> {
        self.store.upsert_read_receipt(message_id, user_id).await
    }

    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Box<dyn ChangeSubscription>> {
        Ok(Box::new(LocalChangeSubscription {
            channel_id: channel_id.clone(),
            changes: BroadcastStream::new(self.store.subscribe_changes()),
        }))
    }
}

#[async_trait]
impl BlobUploader for LocalStoreGateway {
    async fn upload_image(
        &self,
        channel_id: &ChannelId,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let path = format!("{channel_id}/{file_name}");
        self.store
            .store_blob(&self.image_bucket, &path, content_type, &bytes)
            .await
    }
}

struct LocalChangeSubscription {
    channel_id: ChannelId,
    changes: BroadcastStream<StoreChange>,
}

#[async_trait]
impl ChangeSubscription for LocalChangeSubscription {
    async fn next_change(&mut self) -> Option<Result<StoreChange>> {
        loop {
            match self.changes.next().await? {
                Ok(change) if change.channel_id() == &self.channel_id => return Some(Ok(change)),
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    return Some(Err(anyhow!("change feed lagged; {skipped} changes lost")));
                }
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) {
        debug!(channel_id = %self.channel_id, "gateway: local change feed released");
    }
}
