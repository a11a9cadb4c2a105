use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    directory::SenderDirectory, error::ChatError, gateway::StoreGateway, synchronizer::Message,
    ViewerSession,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenByEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub photo_url: Option<String>,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkReadOutcome {
    pub marked: usize,
    pub failed: usize,
}

/// Records "viewer has read message" facts for one open channel.
///
/// Each message is acknowledged at most once per channel-open; the store is
/// idempotent anyway, so this only saves redundant writes.
pub struct ReadReceiptTracker {
    gateway: Arc<dyn StoreGateway>,
    directory: Arc<SenderDirectory>,
    acknowledged: Mutex<HashSet<MessageId>>,
}

impl ReadReceiptTracker {
    pub fn new(gateway: Arc<dyn StoreGateway>, directory: Arc<SenderDirectory>) -> Self {
        Self {
            gateway,
            directory,
            acknowledged: Mutex::new(HashSet::new()),
        }
    }

    pub async fn mark_read(&self, message_id: &MessageId, viewer_id: &UserId) -> Result<(), ChatError> {
        if message_id.is_temp() {
            return Ok(());
        }
        self.gateway
            .upsert_read_receipt(message_id, viewer_id)
            .await
            .map_err(|err| ChatError::Acknowledge(err.to_string()))?;
        self.acknowledged.lock().await.insert(message_id.clone());
        debug!(message_id = %message_id, viewer_id = %viewer_id, "receipts: marked read");
        Ok(())
    }

    /// Marks a message read unless it is the viewer's own or was already
    /// acknowledged since the channel opened. Returns whether a write happened.
    pub async fn acknowledge(&self, message: &Message, viewer_id: &UserId) -> Result<bool, ChatError> {
        if message.sender_id == *viewer_id || message.is_pending() {
            return Ok(false);
        }
        if self.acknowledged.lock().await.contains(&message.id) {
            return Ok(false);
        }
        self.mark_read(&message.id, viewer_id).await?;
        Ok(true)
    }

    /// Marks every message not authored by the viewer. Individual failures
    /// are logged and do not stop the batch.
    pub async fn bulk_mark_read(&self, messages: &[Message], viewer_id: &UserId) -> BulkReadOutcome {
        let mut outcome = BulkReadOutcome::default();
        for message in messages {
            if message.sender_id == *viewer_id || message.is_pending() {
                continue;
            }
            match self.mark_read(&message.id, viewer_id).await {
                Ok(()) => outcome.marked += 1,
                Err(err) => {
                    outcome.failed += 1;
                    warn!(message_id = %message.id, "receipts: {err}");
                }
            }
        }
        outcome
    }

    /// Readers of a message with display names, earliest read first.
    pub async fn seen_by(
        &self,
        message_id: &MessageId,
        session: &ViewerSession,
    ) -> Result<Vec<SeenByEntry>, ChatError> {
        if message_id.is_temp() {
            return Ok(Vec::new());
        }
        let mut receipts = self
            .gateway
            .fetch_read_receipts(message_id)
            .await
            .map_err(|err| ChatError::Fetch(err.to_string()))?;
        receipts.sort_by(|a, b| a.read_at.cmp(&b.read_at).then_with(|| a.user_id.cmp(&b.user_id)));

        let readers = receipts
            .iter()
            .map(|receipt| receipt.user_id.clone())
            .collect::<Vec<_>>();
        self.directory
            .prefetch(self.gateway.as_ref(), session, &readers)
            .await;

        let mut entries = Vec::with_capacity(receipts.len());
        for receipt in receipts {
            let identity = self
                .directory
                .resolve_cached(session, &receipt.user_id)
                .await;
            entries.push(SeenByEntry {
                user_id: receipt.user_id,
                display_name: identity.display_name,
                photo_url: identity.photo_url,
                read_at: receipt.read_at,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
