use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use shared::{domain::MessageId, protocol::NewMessage};
use tracing::{info, warn};

use crate::{
    config::EngineSettings,
    error::ChatError,
    gateway::{BlobUploader, StoreGateway},
    synchronizer::{DeliveryState, Message, SyncHandle},
    ViewerSession,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing to send: blank text and no image.
    Skipped,
    /// The write was accepted; the entry stays pending until the feed echoes it.
    Accepted { temp_id: MessageId },
}

/// Session-unique temporary ids, seeded from the clock.
#[derive(Debug)]
pub struct TempIdGenerator {
    next: AtomicU64,
}

impl TempIdGenerator {
    pub fn new() -> Self {
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        Self::starting_at(seed)
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next_id(&self) -> MessageId {
        MessageId::temp(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TempIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SendPipeline {
    gateway: Arc<dyn StoreGateway>,
    uploader: Arc<dyn BlobUploader>,
    max_image_bytes: usize,
    temp_ids: TempIdGenerator,
}

impl SendPipeline {
    pub fn new(
        gateway: Arc<dyn StoreGateway>,
        uploader: Arc<dyn BlobUploader>,
        settings: &EngineSettings,
    ) -> Self {
        Self::with_temp_ids(gateway, uploader, settings, TempIdGenerator::new())
    }

    pub fn with_temp_ids(
        gateway: Arc<dyn StoreGateway>,
        uploader: Arc<dyn BlobUploader>,
        settings: &EngineSettings,
        temp_ids: TempIdGenerator,
    ) -> Self {
        Self {
            gateway,
            uploader,
            max_image_bytes: settings.max_image_bytes,
            temp_ids,
        }
    }

    /// Inserts an optimistic entry, uploads the image if any, then writes the
    /// message. Any failure rolls the optimistic entry back.
    pub async fn send(
        &self,
        session: &ViewerSession,
        sync: &SyncHandle,
        text: &str,
        image: Option<ImageAttachment>,
    ) -> Result<SendOutcome, ChatError> {
        let text = text.trim();
        let image = image.filter(|image| !image.bytes.is_empty());
        if text.is_empty() && image.is_none() {
            return Ok(SendOutcome::Skipped);
        }
        if let Some(image) = &image {
            if image.bytes.len() > self.max_image_bytes {
                return Err(ChatError::ImageTooLarge {
                    size: image.bytes.len(),
                    limit: self.max_image_bytes,
                });
            }
        }

        let channel_id = sync.channel_id().clone();
        let temp_id = self.temp_ids.next_id();
        let text = (!text.is_empty()).then(|| text.to_string());
        let pending = Message {
            id: temp_id.clone(),
            channel_id: channel_id.clone(),
            sender_id: session.viewer_id.clone(),
            sender: session.identity(),
            text: text.clone(),
            image_url: None,
            created_at: Utc::now(),
            is_own_message: true,
            read_by: Vec::new(),
            state: DeliveryState::Pending,
        };
        sync.apply(|s| s.insert_pending(pending)).await;

        let image_url = match image {
            Some(image) => {
                let file_name = format!("{}-{}", Utc::now().timestamp_millis(), image.file_name);
                match self
                    .uploader
                    .upload_image(
                        &channel_id,
                        &file_name,
                        image.content_type.as_deref(),
                        image.bytes,
                    )
                    .await
                {
                    Ok(url) => Some(url),
                    Err(err) => {
                        sync.apply(|s| s.remove_pending(&temp_id)).await;
                        warn!(channel_id = %channel_id, temp_id = %temp_id, "send: image upload failed: {err}");
                        return Err(ChatError::Upload(err.to_string()));
                    }
                }
            }
            None => None,
        };

        let request = NewMessage {
            channel_id: channel_id.clone(),
            sender_id: session.viewer_id.clone(),
            text,
            image_url,
            client_ref: Some(temp_id.to_string()),
        };
        match self.gateway.insert_message(request).await {
            Ok(row) => {
                info!(
                    channel_id = %channel_id,
                    temp_id = %temp_id,
                    message_id = %row.id,
                    "send: message accepted"
                );
                let abandoned = sync.apply(|s| s.record_write(&temp_id, &row.id)).await;
                if abandoned {
                    info!(channel_id = %channel_id, message_id = %row.id, "send: removing message deleted before confirmation");
                    if let Err(err) = self.gateway.delete_message(&row.id).await {
                        warn!(channel_id = %channel_id, message_id = %row.id, "send: remote delete failed: {err}");
                    }
                }
                Ok(SendOutcome::Accepted { temp_id })
            }
            Err(err) => {
                sync.apply(|s| s.remove_pending(&temp_id)).await;
                warn!(channel_id = %channel_id, temp_id = %temp_id, "send: write failed: {err}");
                Err(ChatError::Send(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/send_pipeline_tests.rs"]
mod tests;
