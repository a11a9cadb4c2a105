//! Ephemeral "who is looking at this channel" primitives.
//!
//! Presence is a side channel, separate from durable storage: a client joins a
//! topic, announces itself with [`PresenceChannel::track`], and every member
//! of the topic observes full-state [`PresenceEvent::Sync`] snapshots plus
//! incremental join/leave notifications. Nothing here is ever persisted.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{ChannelId, UserId};
use tokio::sync::broadcast;

mod local_hub;

pub use local_hub::LocalPresenceHub;

/// Payload announced by one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: UserId,
    pub display_name: String,
    pub online_at: DateTime<Utc>,
}

/// Full presence state of a topic, grouped by presence key.
pub type PresenceState = BTreeMap<String, Vec<PresenceMeta>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Sync(PresenceState),
    Join {
        key: String,
        new_presences: Vec<PresenceMeta>,
    },
    Leave {
        key: String,
        left_presences: Vec<PresenceMeta>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceJoinOptions {
    pub topic: String,
    pub key: String,
}

impl PresenceJoinOptions {
    /// Topic naming used for per-channel presence, keyed by user.
    pub fn for_channel(channel_id: &ChannelId, user_id: &UserId) -> Self {
        Self {
            topic: format!("presence-{channel_id}"),
            key: user_id.to_string(),
        }
    }
}

#[async_trait]
pub trait PresenceChannel: Send + Sync {
    fn topic(&self) -> &str;
    async fn track(&self, meta: PresenceMeta) -> anyhow::Result<()>;
    async fn untrack(&self) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
    fn presence_state(&self) -> PresenceState;
    fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent>;
}

#[async_trait]
pub trait PresenceConnector: Send + Sync {
    async fn join(&self, options: PresenceJoinOptions) -> anyhow::Result<Arc<dyn PresenceChannel>>;
}

/// Flattens a presence state into its individual announcements.
pub fn flatten_state(state: &PresenceState) -> Vec<PresenceMeta> {
    state.values().flatten().cloned().collect()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
