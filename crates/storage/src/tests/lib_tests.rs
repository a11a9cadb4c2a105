use super::*;

async fn seeded_storage() -> (Storage, ChannelId, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = UserId::new("alice");
    let bob = UserId::new("bob");
    storage
        .upsert_user(&alice, "Alice", None)
        .await
        .expect("alice");
    storage
        .upsert_user(&bob, "Bob", Some("https://img.example/bob.png"))
        .await
        .expect("bob");
    let channel = storage
        .create_channel("general", "hsl(173, 80%, 40%)")
        .await
        .expect("channel");
    storage
        .add_channel_member(&channel, &alice)
        .await
        .expect("member");
    storage
        .add_channel_member(&channel, &bob)
        .await
        .expect("member");
    (storage, channel, alice, bob)
}

fn text_message(channel: &ChannelId, sender: &UserId, text: &str) -> NewMessage {
    NewMessage {
        channel_id: channel.clone(),
        sender_id: sender.clone(),
        text: Some(text.to_string()),
        image_url: None,
        client_ref: None,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn lists_channel_messages_oldest_first() {
    let (storage, channel, alice, bob) = seeded_storage().await;
    let first = storage
        .insert_message(&text_message(&channel, &alice, "first"))
        .await
        .expect("first");
    let second = storage
        .insert_message(&text_message(&channel, &bob, "second"))
        .await
        .expect("second");
    let third = storage
        .insert_message(&text_message(&channel, &alice, "third"))
        .await
        .expect("third");

    let messages = storage
        .list_channel_messages(&channel)
        .await
        .expect("messages");
    let ids: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec![first.id, second.id, third.id]);
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at));
}

#[tokio::test]
async fn insert_publishes_change_with_client_ref() {
    let (storage, channel, alice, _) = seeded_storage().await;
    let mut feed = storage.subscribe_changes();

    let mut new_message = text_message(&channel, &alice, "hello");
    new_message.client_ref = Some("temp-1000".to_string());
    let stored = storage.insert_message(&new_message).await.expect("insert");

    match feed.recv().await.expect("change") {
        StoreChange::MessageInserted { message } => {
            assert_eq!(message, stored);
            assert_eq!(message.client_ref.as_deref(), Some("temp-1000"));
        }
        other => panic!("unexpected change: {other:?}"),
    }
}

#[tokio::test]
async fn insert_into_unknown_channel_fails() {
    let (storage, _, alice, _) = seeded_storage().await;
    let result = storage
        .insert_message(&text_message(&ChannelId::new("missing"), &alice, "lost"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn read_receipt_upsert_is_idempotent() {
    let (storage, channel, alice, bob) = seeded_storage().await;
    let message = storage
        .insert_message(&text_message(&channel, &alice, "ping"))
        .await
        .expect("insert");
    let mut feed = storage.subscribe_changes();

    storage
        .upsert_read_receipt(&message.id, &bob)
        .await
        .expect("first receipt");
    let second = storage
        .upsert_read_receipt(&message.id, &bob)
        .await
        .expect("second receipt");

    let receipts = storage
        .list_read_receipts(&message.id)
        .await
        .expect("receipts");
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].user_id, bob);
    assert_eq!(receipts[0].read_at, second.read_at);

    match feed.recv().await.expect("change") {
        StoreChange::ReadReceiptInserted {
            channel_id,
            receipt,
        } => {
            assert_eq!(channel_id, channel);
            assert_eq!(receipt.message_id, message.id);
        }
        other => panic!("unexpected change: {other:?}"),
    }
    assert!(matches!(
        feed.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn read_receipt_for_unknown_message_fails() {
    let (storage, _, _, bob) = seeded_storage().await;
    assert!(storage
        .upsert_read_receipt(&MessageId::new("nope"), &bob)
        .await
        .is_err());
}

#[tokio::test]
async fn update_and_delete_publish_changes() {
    let (storage, channel, alice, bob) = seeded_storage().await;
    let message = storage
        .insert_message(&text_message(&channel, &alice, "draft"))
        .await
        .expect("insert");
    storage
        .upsert_read_receipt(&message.id, &bob)
        .await
        .expect("receipt");
    let mut feed = storage.subscribe_changes();

    assert!(storage
        .update_message_text(&message.id, "final")
        .await
        .expect("update"));
    match feed.recv().await.expect("change") {
        StoreChange::MessageUpdated { message: updated } => {
            assert_eq!(updated.text.as_deref(), Some("final"));
        }
        other => panic!("unexpected change: {other:?}"),
    }

    assert!(storage.delete_message(&message.id).await.expect("delete"));
    match feed.recv().await.expect("change") {
        StoreChange::MessageDeleted {
            channel_id,
            message_id,
        } => {
            assert_eq!(channel_id, channel);
            assert_eq!(message_id, message.id);
        }
        other => panic!("unexpected change: {other:?}"),
    }

    assert!(storage
        .list_read_receipts(&message.id)
        .await
        .expect("receipts")
        .is_empty());
    assert!(!storage.delete_message(&message.id).await.expect("second delete"));
    assert!(!storage
        .update_message_text(&message.id, "ghost")
        .await
        .expect("update missing"));
}

#[tokio::test]
async fn channel_receipts_are_scoped_to_channel() {
    let (storage, channel, alice, bob) = seeded_storage().await;
    let other = storage
        .create_channel("random", "#ff8800")
        .await
        .expect("other channel");
    let in_channel = storage
        .insert_message(&text_message(&channel, &alice, "here"))
        .await
        .expect("insert");
    let elsewhere = storage
        .insert_message(&text_message(&other, &alice, "there"))
        .await
        .expect("insert");
    storage
        .upsert_read_receipt(&in_channel.id, &bob)
        .await
        .expect("receipt");
    storage
        .upsert_read_receipt(&elsewhere.id, &bob)
        .await
        .expect("receipt");

    let receipts = storage
        .list_channel_read_receipts(&channel)
        .await
        .expect("receipts");
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].message_id, in_channel.id);
}

#[tokio::test]
async fn loads_profiles_and_channel_membership() {
    let (storage, channel, alice, bob) = seeded_storage().await;
    let profiles = storage
        .load_profiles(&[bob.clone(), UserId::new("ghost"), alice.clone()])
        .await
        .expect("profiles");
    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[0].display_name, "Alice");
    assert_eq!(
        profiles[1].photo_url.as_deref(),
        Some("https://img.example/bob.png")
    );

    assert!(storage
        .rename_channel(&channel, "announcements")
        .await
        .expect("rename"));
    assert!(storage
        .remove_channel_member(&channel, &bob)
        .await
        .expect("remove"));
    let summary = storage
        .load_channel(&channel)
        .await
        .expect("load")
        .expect("channel exists");
    assert_eq!(summary.name, "announcements");
    assert_eq!(summary.members, vec![alice]);
}

#[tokio::test]
async fn stores_and_loads_blobs_by_url() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let url = storage
        .store_blob("chat-images", "c-1/photo.png", Some("image/png"), b"png-bytes")
        .await
        .expect("store");
    assert_eq!(url, "local-blob://chat-images/c-1/photo.png");

    let blob = storage
        .load_blob(&url)
        .await
        .expect("load")
        .expect("blob exists");
    assert_eq!(blob.bytes, b"png-bytes");
    assert_eq!(blob.content_type.as_deref(), Some("image/png"));
    assert!(storage
        .load_blob("https://elsewhere/x.png")
        .await
        .expect("foreign url")
        .is_none());
}
