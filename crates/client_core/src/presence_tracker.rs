use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use presence::{
    flatten_state, PresenceChannel, PresenceConnector, PresenceEvent, PresenceJoinOptions,
    PresenceMeta, PresenceState,
};
use shared::domain::{ChannelId, UserId};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{error::ChatError, ChatEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub online_at: DateTime<Utc>,
}

/// Collapses a presence snapshot to one entry per user, keeping the earliest
/// announcement, ordered by `online_at`.
pub fn online_from_state(state: &PresenceState) -> Vec<PresenceEntry> {
    let mut by_user: HashMap<UserId, PresenceMeta> = HashMap::new();
    for meta in flatten_state(state) {
        match by_user.get(&meta.user_id) {
            Some(existing) if existing.online_at <= meta.online_at => {}
            _ => {
                by_user.insert(meta.user_id.clone(), meta);
            }
        }
    }
    let mut online = by_user
        .into_values()
        .map(|meta| PresenceEntry {
            user_id: meta.user_id,
            display_name: meta.display_name,
            online_at: meta.online_at,
        })
        .collect::<Vec<_>>();
    online.sort_by(|a, b| {
        a.online_at
            .cmp(&b.online_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    online
}

/// Live set of users viewing the open channel, rebuilt from every full sync.
pub struct PresenceTracker {
    roster: Roster,
    joined: Option<JoinedTopic>,
}

/// Online list shared by the tracker and its listener task.
#[derive(Clone)]
struct Roster {
    online: Arc<RwLock<Vec<PresenceEntry>>>,
    events: broadcast::Sender<ChatEvent>,
}

impl Roster {
    /// Replaces the online list with a fresh snapshot and publishes everyone
    /// except the viewer.
    async fn on_sync(&self, channel_id: &ChannelId, viewer_id: &UserId, state: &PresenceState) {
        let entries = online_from_state(state);
        let others = entries
            .iter()
            .filter(|entry| &entry.user_id != viewer_id)
            .cloned()
            .collect();
        *self.online.write().await = entries;
        let _ = self.events.send(ChatEvent::PresenceChanged {
            channel_id: channel_id.clone(),
            online: others,
        });
    }
}

struct JoinedTopic {
    channel_id: ChannelId,
    viewer_id: UserId,
    channel: Arc<dyn PresenceChannel>,
    listener: JoinHandle<()>,
}

impl Drop for JoinedTopic {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl PresenceTracker {
    pub fn new(events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            roster: Roster {
                online: Arc::new(RwLock::new(Vec::new())),
                events,
            },
            joined: None,
        }
    }

    /// Joins the channel's presence topic and announces the viewer.
    pub async fn join(
        &mut self,
        connector: &dyn PresenceConnector,
        channel_id: &ChannelId,
        viewer_id: &UserId,
        display_name: &str,
    ) -> Result<(), ChatError> {
        self.leave().await;

        let channel = connector
            .join(PresenceJoinOptions::for_channel(channel_id, viewer_id))
            .await
            .map_err(|err| ChatError::Presence(err.to_string()))?;
        // Subscribe before tracking so the sync carrying our own entry is seen.
        let receiver = channel.subscribe_events();
        let listener = spawn_listener(
            receiver,
            Arc::clone(&channel),
            self.roster.clone(),
            channel_id.clone(),
            viewer_id.clone(),
        );
        self.joined = Some(JoinedTopic {
            channel_id: channel_id.clone(),
            viewer_id: viewer_id.clone(),
            channel: Arc::clone(&channel),
            listener,
        });

        channel
            .track(PresenceMeta {
                user_id: viewer_id.clone(),
                display_name: display_name.to_string(),
                online_at: Utc::now(),
            })
            .await
            .map_err(|err| ChatError::Presence(err.to_string()))?;
        info!(
            channel_id = %channel_id,
            viewer_id = %viewer_id,
            topic = channel.topic(),
            "presence: joined"
        );
        Ok(())
    }

    /// Withdraws the viewer's presence and clears local state.
    pub async fn leave(&mut self) {
        if let Some(joined) = self.joined.take() {
            joined.listener.abort();
            if let Err(err) = joined.channel.untrack().await {
                debug!(channel_id = %joined.channel_id, "presence: untrack failed: {err}");
            }
            if let Err(err) = joined.channel.leave().await {
                warn!(channel_id = %joined.channel_id, "presence: leave failed: {err}");
            }
            info!(channel_id = %joined.channel_id, "presence: left");
        }
        self.roster.online.write().await.clear();
    }

    pub async fn online_users(&self) -> Vec<PresenceEntry> {
        self.roster.online.read().await.clone()
    }

    /// Online users other than the viewer.
    pub async fn other_online_users(&self) -> Vec<PresenceEntry> {
        let viewer_id = self.joined.as_ref().map(|joined| &joined.viewer_id);
        self.roster
            .online
            .read()
            .await
            .iter()
            .filter(|entry| Some(&entry.user_id) != viewer_id)
            .cloned()
            .collect()
    }

    pub async fn online_count(&self) -> usize {
        self.other_online_users().await.len()
    }
}

fn spawn_listener(
    mut receiver: broadcast::Receiver<PresenceEvent>,
    channel: Arc<dyn PresenceChannel>,
    roster: Roster,
    channel_id: ChannelId,
    viewer_id: UserId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let state = match receiver.recv().await {
                Ok(PresenceEvent::Sync(state)) => state,
                Ok(PresenceEvent::Join { key, .. }) => {
                    debug!(channel_id = %channel_id, key = %key, "presence: member joined");
                    continue;
                }
                Ok(PresenceEvent::Leave { key, .. }) => {
                    debug!(channel_id = %channel_id, key = %key, "presence: member left");
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(channel_id = %channel_id, skipped, "presence: resyncing after lag");
                    channel.presence_state()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            roster.on_sync(&channel_id, &viewer_id, &state).await;
        }
    })
}

#[cfg(test)]
#[path = "tests/presence_tracker_tests.rs"]
mod tests;
