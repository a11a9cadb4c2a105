//! Store gateway over the REST surface and websocket change feed.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, MessageId, UserId, UserProfile},
    error::ApiError,
    protocol::{
        BlobUploadResponse, MessageRow, NewMessage, ProfileLookupRequest, ReadReceiptRow,
        StoreChange, UpdateMessageRequest,
    },
};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::gateway::{BlobUploader, ChangeSubscription, StoreGateway};

pub struct RestStoreGateway {
    http: Client,
    base_url: Url,
    access_token: Option<String>,
    image_bucket: String,
}

impl RestStoreGateway {
    pub fn new(base_url: &str, image_bucket: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("invalid store url: {base_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("store url must start with http:// or https://"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            access_token: None,
            image_bucket: image_bucket.into(),
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("store url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn realtime_url(&self, channel_id: &ChannelId) -> Result<Url> {
        let mut url = self.endpoint(&["realtime"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("channel_id", channel_id.as_str());
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match ApiError::decode(status.as_u16(), &body) {
            Some(api_error) => Err(api_error.into()),
            None => Err(anyhow!("store request failed with status {status}: {body}")),
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(self.send(request).await?.json::<T>().await?)
    }
}

#[async_trait]
impl StoreGateway for RestStoreGateway {
    async fn fetch_messages(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        let url = self.endpoint(&["channels", channel_id.as_str(), "messages"])?;
        self.send_json(self.http.get(url)).await
    }

    async fn fetch_read_receipts(&self, message_id: &MessageId) -> Result<Vec<ReadReceiptRow>> {
        let url = self.endpoint(&["messages", message_id.as_str(), "reads"])?;
        self.send_json(self.http.get(url)).await
    }

    async fn fetch_channel_read_receipts(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ReadReceiptRow>> {
        let url = self.endpoint(&["channels", channel_id.as_str(), "reads"])?;
        self.send_json(self.http.get(url)).await
    }

    async fn fetch_profiles(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint(&["users", "lookup"])?;
        let request = ProfileLookupRequest {
            user_ids: user_ids.to_vec(),
        };
        self.send_json(self.http.post(url).json(&request)).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        let url = self.endpoint(&["messages"])?;
        self.send_json(self.http.post(url).json(&message)).await
    }

    async fn update_message_text(&self, message_id: &MessageId, text: &str) -> Result<()> {
        let url = self.endpoint(&["messages", message_id.as_str()])?;
        let request = UpdateMessageRequest {
            text: text.to_string(),
        };
        self.send(self.http.patch(url).json(&request)).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let url = self.endpoint(&["messages", message_id.as_str()])?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<ReadReceiptRow> {
        let url = self.endpoint(&["messages", message_id.as_str(), "reads", user_id.as_str()])?;
        self.send_json(self.http.put(url)).await
    }

    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Box<dyn ChangeSubscription>> {
        let url = self.realtime_url(channel_id)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect change feed: {url}"))?;
        debug!(channel_id = %channel_id, "gateway: change feed connected");
        Ok(Box::new(RemoteChangeSubscription {
            channel_id: channel_id.clone(),
            stream,
        }))
    }
}

#[async_trait]
impl BlobUploader for RestStoreGateway {
    async fn upload_image(
        &self,
        channel_id: &ChannelId,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let url = self.endpoint(&[
            "storage",
            self.image_bucket.as_str(),
            channel_id.as_str(),
            file_name,
        ])?;
        let request = self
            .http
            .post(url)
            .header(
                CONTENT_TYPE,
                content_type.unwrap_or("application/octet-stream"),
            )
            .body(bytes);
        let response: BlobUploadResponse = self.send_json(request).await?;
        Ok(response.url)
    }
}

struct RemoteChangeSubscription {
    channel_id: ChannelId,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChangeSubscription for RemoteChangeSubscription {
    async fn next_change(&mut self) -> Option<Result<StoreChange>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<StoreChange>(&text) {
                    Ok(change) if change.channel_id() == &self.channel_id => {
                        return Some(Ok(change))
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(channel_id = %self.channel_id, "gateway: invalid change frame: {err}");
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(anyhow!("change feed receive failed: {err}"))),
            }
        }
    }

    async fn unsubscribe(mut self: Box<Self>) {
        if let Err(err) = self.stream.close(None).await {
            debug!(channel_id = %self.channel_id, "gateway: change feed close failed: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/remote_gateway_tests.rs"]
mod tests;
