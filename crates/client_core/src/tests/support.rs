use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ChannelId, MessageId, UserId, UserProfile},
    protocol::{MessageRow, NewMessage, ReadReceiptRow, StoreChange},
};
use tokio::sync::{broadcast, Mutex};

use crate::gateway::{BlobUploader, ChangeSubscription, StoreGateway};

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_550_400 + seconds, 0).unwrap()
}

pub(crate) fn row(id: &str, channel: &str, sender: &str, text: &str, seconds: i64) -> MessageRow {
    MessageRow {
        id: MessageId::new(id),
        channel_id: ChannelId::new(channel),
        sender_id: UserId::new(sender),
        text: Some(text.to_string()),
        image_url: None,
        created_at: at(seconds),
        client_ref: None,
    }
}

pub(crate) fn receipt(message: &str, user: &str, seconds: i64) -> ReadReceiptRow {
    ReadReceiptRow {
        message_id: MessageId::new(message),
        user_id: UserId::new(user),
        read_at: at(seconds),
    }
}

/// Message `None` on the feed simulates a dropped connection.
type FeedItem = Option<StoreChange>;

/// In-memory gateway recording every write, with switchable failures.
pub(crate) struct FakeGateway {
    pub messages: Mutex<Vec<MessageRow>>,
    pub receipts: Mutex<Vec<ReadReceiptRow>>,
    pub profiles: Mutex<HashMap<UserId, UserProfile>>,
    pub inserted: Mutex<Vec<NewMessage>>,
    pub receipt_writes: Mutex<Vec<(MessageId, UserId)>>,
    pub deleted: Mutex<Vec<MessageId>>,
    pub edited: Mutex<Vec<(MessageId, String)>>,
    pub profile_lookups: AtomicUsize,
    pub unsubscribed: Arc<AtomicUsize>,
    pub fail_fetch: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_receipts: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_profiles: AtomicBool,
    /// When set, accepted inserts are echoed on the feed.
    pub echo_inserts: AtomicBool,
    next_id: AtomicUsize,
    feed: broadcast::Sender<FeedItem>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        let (feed, _) = broadcast::channel(64);
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            receipts: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            inserted: Mutex::new(Vec::new()),
            receipt_writes: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            edited: Mutex::new(Vec::new()),
            profile_lookups: AtomicUsize::new(0),
            unsubscribed: Arc::new(AtomicUsize::new(0)),
            fail_fetch: AtomicBool::new(false),
            fail_insert: AtomicBool::new(false),
            fail_receipts: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_profiles: AtomicBool::new(false),
            echo_inserts: AtomicBool::new(false),
            next_id: AtomicUsize::new(1),
            feed,
        })
    }

    pub async fn with_profile(&self, user: &str, name: &str) {
        self.profiles.lock().await.insert(
            UserId::new(user),
            UserProfile {
                user_id: UserId::new(user),
                display_name: name.to_string(),
                photo_url: None,
            },
        );
    }

    pub fn push(&self, change: StoreChange) {
        let _ = self.feed.send(Some(change));
    }

    pub fn drop_feed(&self) {
        let _ = self.feed.send(None);
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }
}

#[async_trait]
impl StoreGateway for FakeGateway {
    async fn fetch_messages(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        let mut rows = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|row| &row.channel_id == channel_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn fetch_read_receipts(&self, message_id: &MessageId) -> Result<Vec<ReadReceiptRow>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        Ok(self
            .receipts
            .lock()
            .await
            .iter()
            .filter(|r| &r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn fetch_channel_read_receipts(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ReadReceiptRow>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        let messages = self.messages.lock().await;
        Ok(self
            .receipts
            .lock()
            .await
            .iter()
            .filter(|r| {
                messages
                    .iter()
                    .any(|m| m.id == r.message_id && &m.channel_id == channel_id)
            })
            .cloned()
            .collect())
    }

    async fn fetch_profiles(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>> {
        self.profile_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_profiles.load(Ordering::SeqCst) {
            return Err(anyhow!("profiles unavailable"));
        }
        let profiles = self.profiles.lock().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| profiles.get(id).cloned())
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        self.inserted.lock().await.push(message.clone());
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(anyhow!("quota exceeded"));
        }
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = MessageRow {
            id: MessageId::new(format!("msg-{seq}")),
            channel_id: message.channel_id,
            sender_id: message.sender_id,
            text: message.text,
            image_url: message.image_url,
            created_at: Utc::now(),
            client_ref: message.client_ref,
        };
        self.messages.lock().await.push(row.clone());
        if self.echo_inserts.load(Ordering::SeqCst) {
            self.push(StoreChange::MessageInserted {
                message: row.clone(),
            });
        }
        Ok(row)
    }

    async fn update_message_text(&self, message_id: &MessageId, text: &str) -> Result<()> {
        self.edited
            .lock()
            .await
            .push((message_id.clone(), text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        self.deleted.lock().await.push(message_id.clone());
        self.messages.lock().await.retain(|m| &m.id != message_id);
        Ok(())
    }

    async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<ReadReceiptRow> {
        self.receipt_writes
            .lock()
            .await
            .push((message_id.clone(), user_id.clone()));
        if self.fail_receipts.load(Ordering::SeqCst) {
            return Err(anyhow!("receipt write rejected"));
        }
        let receipt = ReadReceiptRow {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            read_at: Utc::now(),
        };
        let mut receipts = self.receipts.lock().await;
        match receipts
            .iter_mut()
            .find(|r| &r.message_id == message_id && &r.user_id == user_id)
        {
            Some(existing) => existing.read_at = receipt.read_at,
            None => receipts.push(receipt.clone()),
        }
        Ok(receipt)
    }

    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Box<dyn ChangeSubscription>> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow!("realtime refused"));
        }
        Ok(Box::new(FakeSubscription {
            channel_id: channel_id.clone(),
            feed: self.feed.subscribe(),
            unsubscribed: Arc::clone(&self.unsubscribed),
        }))
    }
}

struct FakeSubscription {
    channel_id: ChannelId,
    feed: broadcast::Receiver<FeedItem>,
    unsubscribed: Arc<AtomicUsize>,
}

#[async_trait]
impl ChangeSubscription for FakeSubscription {
    async fn next_change(&mut self) -> Option<Result<StoreChange>> {
        loop {
            match self.feed.recv().await {
                Ok(Some(change)) if change.channel_id() == &self.channel_id => {
                    return Some(Ok(change))
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Some(Err(anyhow!("connection reset"))),
                Err(_) => return None,
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) {
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blob storage double that records uploads or fails them.
pub(crate) struct FakeUploader {
    pub uploads: Mutex<Vec<(ChannelId, String, usize)>>,
    pub fail: AtomicBool,
}

impl FakeUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uploads: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BlobUploader for FakeUploader {
    async fn upload_image(
        &self,
        channel_id: &ChannelId,
        file_name: &str,
        _content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String> {
        self.uploads
            .lock()
            .await
            .push((channel_id.clone(), file_name.to_string(), bytes.len()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("bucket unavailable"));
        }
        Ok(format!("https://cdn.test/{channel_id}/{file_name}"))
    }
}
