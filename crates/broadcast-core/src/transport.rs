// Messaging transport collaborator (spec §6.2). An abstract trait plus one
// concrete HTTP-bridge implementation, grounded on engine/telegram.rs's
// send/poll shape: a reqwest::Client wrapped around a REST bridge, JSON
// bodies, chunked-message splitting, best-effort retry without special
// formatting on first failure.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// A chat group the transport knows about (spec §6.2 `list_groups`).
#[derive(Debug, Clone, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
}

/// A single inbound event from the transport's event source (spec §6.2).
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Text { chat_id: String, sender_id: String, text: String },
    Media { chat_id: String, sender_id: String, caption: Option<String>, media_url: String },
}

/// Abstract messaging transport. The engine depends only on this trait so
/// tests can swap in an in-memory fake; production wires `HttpTransport`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> EngineResult<()>;
    async fn send_image(&self, chat_id: &str, bytes: Vec<u8>, caption: Option<&str>) -> EngineResult<()>;
    async fn list_groups(&self) -> EngineResult<Vec<GroupInfo>>;
    async fn download_media(&self, media_url: &str) -> EngineResult<Vec<u8>>;
}

/// REST bridge to the messaging service (spec §6.2). One bridge instance is
/// shared across the Router and the Queue Dispatcher.
pub struct HttpTransport {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct BridgeAck {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListGroupsResponse {
    groups: Vec<GroupInfo>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpTransport {
            http: Client::builder().timeout(TRANSPORT_TIMEOUT).build().expect("reqwest client"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_ack(&self, path: &str, body: serde_json::Value) -> EngineResult<()> {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(EngineError::Network)?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(EngineError::transport(format!("{path} returned {status}")));
        }
        let ack: BridgeAck = resp.json().await.map_err(EngineError::Network)?;
        if !ack.ok {
            return Err(EngineError::transport(ack.error.unwrap_or_else(|| "bridge reported failure".into())));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    /// WhatsApp message bodies are capped; split long drafts the way the
    /// teacher's Telegram bridge chunks at 4000 chars before sending.
    async fn send_text(&self, chat_id: &str, text: &str) -> EngineResult<()> {
        for chunk in split_message(text, 4000) {
            if let Err(e) = self.post_ack("/send_text", json!({ "chat_id": chat_id, "text": chunk })).await {
                warn!("[transport] send_text chunk failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn send_image(&self, chat_id: &str, bytes: Vec<u8>, caption: Option<&str>) -> EngineResult<()> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        self.post_ack("/send_image", json!({ "chat_id": chat_id, "image_b64": encoded, "caption": caption })).await
    }

    async fn list_groups(&self) -> EngineResult<Vec<GroupInfo>> {
        let resp = self
            .http
            .get(self.url("/list_groups"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(EngineError::Network)?;
        let parsed: ListGroupsResponse = resp.json().await.map_err(EngineError::Network)?;
        Ok(parsed.groups)
    }

    async fn download_media(&self, media_url: &str) -> EngineResult<Vec<u8>> {
        let resp = self
            .http
            .get(media_url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(EngineError::Network)?;
        if !resp.status().is_success() {
            return Err(EngineError::transport(format!("media download returned {}", resp.status())));
        }
        Ok(resp.bytes().await.map_err(EngineError::Network)?.to_vec())
    }
}

/// Split `text` into chunks no longer than `limit` bytes, breaking on
/// whitespace where possible so a draft's paragraphs stay intact.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let mut split_at = limit;
        if let Some(pos) = rest[..limit].rfind('\n') {
            split_at = pos + 1;
        } else if let Some(pos) = rest[..limit].rfind(' ') {
            split_at = pos + 1;
        }
        chunks.push(rest[..split_at].to_string());
        rest = &rest[split_at..];
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = split_message("hello", 4000);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn long_text_splits_on_whitespace() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 10);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= 11));
    }

    #[test]
    fn rejoining_chunks_reproduces_original() {
        let text = "word ".repeat(50);
        let chunks = split_message(&text, 30);
        assert_eq!(chunks.concat(), text);
    }
}
