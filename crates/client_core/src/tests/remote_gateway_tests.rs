use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use shared::error::ErrorCode;
use tokio::net::TcpListener;

use super::*;
use crate::test_support::{receipt, row};

async fn list_messages(Path(channel_id): Path<String>) -> Json<Vec<MessageRow>> {
    Json(vec![
        row("m-1", &channel_id, "bob", "hello", 10),
        row("m-2", &channel_id, "alice", "hi", 20),
    ])
}

async fn reject_message(Json(message): Json<NewMessage>) -> impl IntoResponse {
    let body = ApiError::new(
        ErrorCode::QuotaExceeded,
        format!("channel {} is over quota", message.channel_id),
    );
    (StatusCode::TOO_MANY_REQUESTS, Json(body))
}

async fn mark_read(Path((message_id, user_id)): Path<(String, String)>) -> Json<ReadReceiptRow> {
    Json(receipt(&message_id, &user_id, 42))
}

async fn store_image(
    Path((bucket, channel_id, file_name)): Path<(String, String, String)>,
    body: Bytes,
) -> Json<BlobUploadResponse> {
    Json(BlobUploadResponse {
        url: format!(
            "https://cdn.test/{bucket}/{channel_id}/{file_name}?size={}",
            body.len()
        ),
    })
}

async fn realtime(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let channel_id = params.get("channel_id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| push_changes(socket, channel_id))
}

async fn push_changes(mut socket: WebSocket, channel_id: String) {
    let elsewhere = StoreChange::MessageInserted {
        message: row("x-1", "other", "bob", "not for you", 1),
    };
    let here = StoreChange::MessageInserted {
        message: row("m-3", &channel_id, "bob", "live", 30),
    };
    for frame in [
        "not json".to_string(),
        serde_json::to_string(&elsewhere).unwrap(),
        serde_json::to_string(&here).unwrap(),
    ] {
        if socket.send(WsMessage::Text(frame)).await.is_err() {
            return;
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn spawn_store_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/channels/:channel_id/messages", get(list_messages))
        .route("/messages", post(reject_message))
        .route("/messages/:message_id/reads/:user_id", put(mark_read))
        .route("/storage/:bucket/:channel_id/:file_name", post(store_image))
        .route("/realtime", get(realtime));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[test]
fn rejects_non_http_urls() {
    assert!(RestStoreGateway::new("ftp://store.test", "chat-images").is_err());
    assert!(RestStoreGateway::new("not a url", "chat-images").is_err());
}

#[test]
fn realtime_url_follows_transport_security() {
    let plain = RestStoreGateway::new("http://store.test/api/", "chat-images").expect("gateway");
    assert_eq!(
        plain
            .realtime_url(&ChannelId::new("c 1"))
            .expect("url")
            .as_str(),
        "ws://store.test/api/realtime?channel_id=c+1"
    );

    let secure = RestStoreGateway::new("https://store.test", "chat-images").expect("gateway");
    assert!(secure
        .realtime_url(&ChannelId::new("c-1"))
        .expect("url")
        .as_str()
        .starts_with("wss://store.test/realtime"));
}

#[tokio::test]
async fn fetches_channel_history() {
    let server_url = spawn_store_server().await;
    let gateway = RestStoreGateway::new(&server_url, "chat-images").expect("gateway");

    let rows = gateway
        .fetch_messages(&ChannelId::new("c-1"))
        .await
        .expect("fetch");

    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.channel_id.as_str() == "c-1"));
}

#[tokio::test]
async fn error_bodies_decode_as_api_errors() {
    let server_url = spawn_store_server().await;
    let gateway = RestStoreGateway::new(&server_url, "chat-images").expect("gateway");

    let err = gateway
        .insert_message(NewMessage {
            channel_id: ChannelId::new("c-1"),
            sender_id: UserId::new("alice"),
            text: Some("hi".into()),
            image_url: None,
            client_ref: Some("temp-1".into()),
        })
        .await
        .expect_err("quota");

    let api = err.downcast_ref::<ApiError>().expect("api error");
    assert_eq!(api.code, ErrorCode::QuotaExceeded);
    assert_eq!(api.status, Some(429));
    assert_eq!(api.message, "channel c-1 is over quota");
}

#[tokio::test]
async fn read_receipts_and_uploads_use_scoped_paths() {
    let server_url = spawn_store_server().await;
    let gateway = RestStoreGateway::new(&server_url, "chat-images").expect("gateway");

    let receipt = gateway
        .upsert_read_receipt(&MessageId::new("m-1"), &UserId::new("carol"))
        .await
        .expect("receipt");
    assert_eq!(receipt.message_id.as_str(), "m-1");
    assert_eq!(receipt.user_id.as_str(), "carol");

    let url = gateway
        .upload_image(
            &ChannelId::new("c-1"),
            "cat.png",
            Some("image/png"),
            vec![1, 2, 3],
        )
        .await
        .expect("upload");
    assert_eq!(url, "https://cdn.test/chat-images/c-1/cat.png?size=3");
}

#[tokio::test]
async fn change_feed_yields_channel_changes_until_closed() {
    let server_url = spawn_store_server().await;
    let gateway = RestStoreGateway::new(&server_url, "chat-images").expect("gateway");

    let mut feed = gateway
        .subscribe(&ChannelId::new("c-1"))
        .await
        .expect("subscribe");

    match feed.next_change().await {
        Some(Ok(StoreChange::MessageInserted { message })) => {
            assert_eq!(message.id.as_str(), "m-3");
        }
        other => panic!("unexpected change: {other:?}"),
    }
    assert!(feed.next_change().await.is_none());
    feed.unsubscribe().await;
}
