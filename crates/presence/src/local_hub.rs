use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    PresenceChannel, PresenceConnector, PresenceEvent, PresenceJoinOptions, PresenceMeta,
    PresenceState,
};

const TOPIC_EVENT_CAPACITY: usize = 256;

/// In-process presence broadcast layer.
///
/// Membership is bound to the lifetime of each [`PresenceChannel`] handle:
/// dropping a handle without calling `leave` withdraws its announcement the
/// same way a closed socket would.
#[derive(Clone, Default)]
pub struct LocalPresenceHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, Topic>,
    next_connection_id: u64,
}

struct Topic {
    events: broadcast::Sender<PresenceEvent>,
    entries: BTreeMap<u64, (String, PresenceMeta)>,
    open_handles: usize,
}

impl Topic {
    fn new() -> Self {
        let (events, _) = broadcast::channel(TOPIC_EVENT_CAPACITY);
        Self {
            events,
            entries: BTreeMap::new(),
            open_handles: 0,
        }
    }

    fn state(&self) -> PresenceState {
        let mut state = PresenceState::new();
        for (key, meta) in self.entries.values() {
            state.entry(key.clone()).or_default().push(meta.clone());
        }
        state
    }

    fn remove_connection(&mut self, connection_id: u64) {
        if let Some((key, meta)) = self.entries.remove(&connection_id) {
            let _ = self.events.send(PresenceEvent::Leave {
                key,
                left_presences: vec![meta],
            });
            let _ = self.events.send(PresenceEvent::Sync(self.state()));
        }
    }
}

impl LocalPresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a topic, as any member would observe it.
    pub fn topic_state(&self, topic: &str) -> PresenceState {
        lock(&self.inner)
            .topics
            .get(topic)
            .map(Topic::state)
            .unwrap_or_default()
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.inner).topics.len()
    }
}

#[async_trait]
impl PresenceConnector for LocalPresenceHub {
    async fn join(&self, options: PresenceJoinOptions) -> Result<Arc<dyn PresenceChannel>> {
        let mut guard = lock(&self.inner);
        guard.next_connection_id += 1;
        let connection_id = guard.next_connection_id;
        let topic = guard
            .topics
            .entry(options.topic.clone())
            .or_insert_with(Topic::new);
        topic.open_handles += 1;
        let events = topic.events.clone();
        debug!(
            topic = %options.topic,
            key = %options.key,
            connection_id,
            "presence: channel joined"
        );

        Ok(Arc::new(LocalPresenceChannel {
            hub: Arc::clone(&self.inner),
            topic: options.topic,
            key: options.key,
            connection_id,
            events,
            left: Mutex::new(false),
        }))
    }
}

struct LocalPresenceChannel {
    hub: Arc<Mutex<HubState>>,
    topic: String,
    key: String,
    connection_id: u64,
    events: broadcast::Sender<PresenceEvent>,
    left: Mutex<bool>,
}

impl LocalPresenceChannel {
    fn has_left(&self) -> bool {
        *lock(&self.left)
    }

    fn withdraw(&self) {
        let mut hub = lock(&self.hub);
        if let Some(topic) = hub.topics.get_mut(&self.topic) {
            topic.remove_connection(self.connection_id);
        }
    }

    fn close(&self) {
        {
            let mut left = lock(&self.left);
            if *left {
                return;
            }
            *left = true;
        }

        let mut hub = lock(&self.hub);
        let remove_topic = match hub.topics.get_mut(&self.topic) {
            Some(topic) => {
                topic.remove_connection(self.connection_id);
                topic.open_handles = topic.open_handles.saturating_sub(1);
                topic.open_handles == 0 && topic.entries.is_empty()
            }
            None => false,
        };
        if remove_topic {
            hub.topics.remove(&self.topic);
        }
        debug!(
            topic = %self.topic,
            key = %self.key,
            connection_id = self.connection_id,
            "presence: channel closed"
        );
    }
}

#[async_trait]
impl PresenceChannel for LocalPresenceChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn track(&self, meta: PresenceMeta) -> Result<()> {
        if self.has_left() {
            return Err(anyhow!("presence channel {} already left", self.topic));
        }

        let mut hub = lock(&self.hub);
        let topic = hub
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| anyhow!("presence topic {} is gone", self.topic))?;
        topic
            .entries
            .insert(self.connection_id, (self.key.clone(), meta.clone()));
        let _ = topic.events.send(PresenceEvent::Join {
            key: self.key.clone(),
            new_presences: vec![meta],
        });
        let _ = topic.events.send(PresenceEvent::Sync(topic.state()));
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        self.withdraw();
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.close();
        Ok(())
    }

    fn presence_state(&self) -> PresenceState {
        lock(&self.hub)
            .topics
            .get(&self.topic)
            .map(Topic::state)
            .unwrap_or_default()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}

impl Drop for LocalPresenceChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
