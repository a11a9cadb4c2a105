//! Authoritative local list of messages for the open channel.
//!
//! All mutations go through [`MessageSynchronizer`]; it never performs I/O.
//! [`SyncHandle`] wraps it for sharing between the send pipeline and the
//! change-feed task and republishes a snapshot whenever the list changes.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::MessageRow,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{
    directory::SenderDirectory, error::ChatError, gateway::StoreGateway, ChatEvent, ViewerSession,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub display_name: String,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistic entry that the store has not echoed back yet.
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub sender: SenderIdentity,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_own_message: bool,
    pub read_by: Vec<UserId>,
    pub state: DeliveryState,
}

impl Message {
    pub fn confirmed(
        row: MessageRow,
        viewer_id: &UserId,
        sender: SenderIdentity,
        read_by: Vec<UserId>,
    ) -> Self {
        let is_own_message = &row.sender_id == viewer_id;
        Self {
            id: row.id,
            channel_id: row.channel_id,
            sender_id: row.sender_id,
            sender,
            text: row.text,
            image_url: row.image_url,
            created_at: row.created_at,
            is_own_message,
            read_by,
            state: DeliveryState::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }
}

/// What happened to an inserted row echoed by the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// An own pending entry was replaced in place by its canonical row.
    Reconciled {
        temp_id: MessageId,
        message_id: MessageId,
    },
    /// Own message with no pending counterpart, e.g. sent from another session.
    AppendedOwn { message_id: MessageId },
    AppendedForeign { message_id: MessageId },
    /// A message with this canonical id is already present.
    Duplicate { message_id: MessageId },
    /// The pending entry was deleted locally before its echo arrived.
    Abandoned { message_id: MessageId },
    OtherChannel,
}

#[derive(Debug)]
pub struct MessageSynchronizer {
    channel_id: ChannelId,
    viewer_id: UserId,
    messages: Vec<Message>,
    abandoned_refs: HashSet<String>,
    /// Pending entries whose write landed but whose echo has not arrived yet.
    written_refs: HashMap<String, MessageId>,
    /// Canonical ids already deleted from the store by the sender; their
    /// echo is dropped.
    withdrawn_ids: HashSet<MessageId>,
    revision: u64,
}

impl MessageSynchronizer {
    pub fn new(channel_id: ChannelId, viewer_id: UserId) -> Self {
        Self {
            channel_id,
            viewer_id,
            messages: Vec::new(),
            abandoned_refs: HashSet::new(),
            written_refs: HashMap::new(),
            withdrawn_ids: HashSet::new(),
            revision: 0,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn viewer_id(&self) -> &UserId {
        &self.viewer_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == message_id)
    }

    /// Bumped on every change to the list.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_pending()).count()
    }

    /// Replaces the confirmed part of the list with `history`. Pending
    /// entries survive at the tail.
    pub fn install_history(&mut self, mut history: Vec<Message>) {
        history.sort_by_key(|m| m.created_at);
        let mut seen = HashSet::new();
        history.retain(|m| seen.insert(m.id.clone()));
        let pending = self
            .messages
            .drain(..)
            .filter(Message::is_pending)
            .collect::<Vec<_>>();
        self.messages = history;
        self.messages.extend(pending);
        self.touch();
    }

    pub fn insert_pending(&mut self, message: Message) {
        debug_assert!(message.is_pending());
        self.messages.push(message);
        self.touch();
    }

    /// Rolls back an optimistic entry. Returns whether it was still present.
    pub fn remove_pending(&mut self, temp_id: &MessageId) -> bool {
        self.abandoned_refs.remove(temp_id.as_str());
        let before = self.messages.len();
        self.messages.retain(|m| !(m.is_pending() && &m.id == temp_id));
        let removed = self.messages.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Records that the durable write for `temp_id` landed as `message_id`.
    /// Returns true when the pending entry was deleted in the meantime, in
    /// which case the caller removes `message_id` from the store and its echo
    /// is dropped.
    pub fn record_write(&mut self, temp_id: &MessageId, message_id: &MessageId) -> bool {
        if self.abandoned_refs.remove(temp_id.as_str()) {
            self.withdrawn_ids.insert(message_id.clone());
            return true;
        }
        let still_pending = self
            .messages
            .iter()
            .any(|m| m.is_pending() && &m.id == temp_id);
        if still_pending {
            self.written_refs
                .insert(temp_id.to_string(), message_id.clone());
        }
        false
    }

    /// Deletes an own pending entry. Returns its canonical id when the write
    /// has already landed, so the caller removes it from the store; otherwise
    /// the write completion or the echo takes care of that.
    pub fn delete_pending(&mut self, temp_id: &MessageId) -> Option<MessageId> {
        self.apply_delete(temp_id)?;
        let message_id = self.written_refs.remove(temp_id.as_str())?;
        self.abandoned_refs.remove(temp_id.as_str());
        self.withdrawn_ids.insert(message_id.clone());
        Some(message_id)
    }

    pub fn apply_remote_insert(&mut self, row: MessageRow, sender: SenderIdentity) -> InsertOutcome {
        if row.channel_id != self.channel_id {
            return InsertOutcome::OtherChannel;
        }
        if self.get(&row.id).is_some() || self.withdrawn_ids.remove(&row.id) {
            return InsertOutcome::Duplicate { message_id: row.id };
        }

        if row.sender_id != self.viewer_id {
            let message_id = row.id.clone();
            let message = Message::confirmed(row, &self.viewer_id, sender, Vec::new());
            self.insert_sorted(message);
            return InsertOutcome::AppendedForeign { message_id };
        }

        if let Some(client_ref) = row.client_ref.as_deref() {
            if self.abandoned_refs.remove(client_ref) {
                return InsertOutcome::Abandoned { message_id: row.id };
            }
        }

        let pending_index = match row.client_ref.as_deref() {
            Some(client_ref) => self
                .messages
                .iter()
                .position(|m| m.is_pending() && m.id.as_str() == client_ref),
            // Without a correlation id the newest pending entry is assumed.
            None => self.messages.iter().rposition(Message::is_pending),
        };

        let message_id = row.id.clone();
        let message = Message::confirmed(row, &self.viewer_id, sender, Vec::new());
        match pending_index {
            Some(index) => {
                let temp_id = self.messages.remove(index).id;
                self.written_refs.remove(temp_id.as_str());
                self.insert_sorted(message);
                InsertOutcome::Reconciled {
                    temp_id,
                    message_id,
                }
            }
            None => {
                self.insert_sorted(message);
                InsertOutcome::AppendedOwn { message_id }
            }
        }
    }

    /// Replaces the text of a confirmed message. Returns whether anything changed.
    pub fn apply_edit(&mut self, message_id: &MessageId, text: &str) -> bool {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|m| &m.id == message_id && !m.is_pending())
        else {
            return false;
        };
        if message.text.as_deref() == Some(text) {
            return false;
        }
        message.text = Some(text.to_string());
        self.touch();
        true
    }

    /// Removes a message. Deleting a pending entry also suppresses its echo
    /// if the write is still in flight.
    pub fn apply_delete(&mut self, message_id: &MessageId) -> Option<Message> {
        self.withdrawn_ids.remove(message_id);
        let index = self.messages.iter().position(|m| &m.id == message_id)?;
        let removed = self.messages.remove(index);
        if removed.is_pending() {
            self.abandoned_refs.insert(removed.id.to_string());
        }
        self.touch();
        Some(removed)
    }

    /// Adds `reader` to the read-by list. Receipts for unknown or pending
    /// messages are dropped.
    pub fn apply_read_receipt(&mut self, message_id: &MessageId, reader: &UserId) -> bool {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|m| &m.id == message_id && !m.is_pending())
        else {
            return false;
        };
        if message.read_by.contains(reader) {
            return false;
        }
        message.read_by.push(reader.clone());
        self.touch();
        true
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .messages
            .iter()
            .rposition(|m| m.created_at <= message.created_at)
            .map_or(0, |i| i + 1);
        self.messages.insert(index, message);
        self.touch();
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

/// Shared access to a [`MessageSynchronizer`] that publishes
/// [`ChatEvent::MessagesChanged`] after each effective mutation.
#[derive(Clone)]
pub struct SyncHandle {
    channel_id: ChannelId,
    state: Arc<Mutex<MessageSynchronizer>>,
    events: broadcast::Sender<ChatEvent>,
}

impl SyncHandle {
    pub fn new(synchronizer: MessageSynchronizer, events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            channel_id: synchronizer.channel_id().clone(),
            state: Arc::new(Mutex::new(synchronizer)),
            events,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub async fn apply<R>(&self, mutate: impl FnOnce(&mut MessageSynchronizer) -> R) -> R {
        let (result, changed) = {
            let mut guard = self.state.lock().await;
            let before = guard.revision();
            let result = mutate(&mut guard);
            let changed = (guard.revision() != before).then(|| guard.messages().to_vec());
            (result, changed)
        };
        if let Some(messages) = changed {
            let _ = self.events.send(ChatEvent::MessagesChanged {
                channel_id: self.channel_id.clone(),
                messages,
            });
        }
        result
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.state.lock().await.messages().to_vec()
    }
}

/// Loads the full history of a channel with read-by lists and sender
/// identities attached.
pub async fn load_history(
    gateway: &dyn StoreGateway,
    directory: &SenderDirectory,
    session: &ViewerSession,
    channel_id: &ChannelId,
) -> Result<Vec<Message>, ChatError> {
    let rows = gateway
        .fetch_messages(channel_id)
        .await
        .map_err(|err| ChatError::Fetch(err.to_string()))?;
    let receipts = gateway
        .fetch_channel_read_receipts(channel_id)
        .await
        .map_err(|err| ChatError::Fetch(err.to_string()))?;

    let mut read_by: HashMap<MessageId, Vec<UserId>> = HashMap::new();
    for receipt in receipts {
        let readers = read_by.entry(receipt.message_id).or_default();
        if !readers.contains(&receipt.user_id) {
            readers.push(receipt.user_id);
        }
    }

    let mut senders = rows
        .iter()
        .map(|row| row.sender_id.clone())
        .collect::<Vec<_>>();
    senders.sort();
    senders.dedup();
    directory.prefetch(gateway, session, &senders).await;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        if &row.channel_id != channel_id {
            warn!(
                channel_id = %channel_id,
                message_id = %row.id,
                "sync: dropping history row from another channel"
            );
            continue;
        }
        let sender = directory.resolve_cached(session, &row.sender_id).await;
        let readers = read_by.remove(&row.id).unwrap_or_default();
        messages.push(Message::confirmed(row, &session.viewer_id, sender, readers));
    }
    debug!(
        channel_id = %channel_id,
        count = messages.len(),
        "sync: history loaded"
    );
    Ok(messages)
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
