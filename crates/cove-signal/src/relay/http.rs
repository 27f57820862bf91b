use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{RelayError, SignalRelay};
use crate::signal::{Signal, WireSignal};

pub const SIGNAL_PATH: &str = "/api/webrtc/signal";
pub const ROOM_EXISTS_PATH: &str = "/api/room/exists";

/// Body of `POST /api/webrtc/signal`. Any `timestamp` the client sends is
/// replaced by the relay's own stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "roomCode")]
    pub room_code: String,
    #[serde(flatten)]
    pub signal: WireSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub success: bool,
    pub timestamp: u64,
}

/// Body of `GET /api/webrtc/signal`. Signals stay raw here so that one bad
/// record does not poison the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub signals: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomExistsResponse {
    pub exists: bool,
}

/// Relay reached over the cove-relay HTTP API.
#[derive(Clone)]
pub struct HttpRelay {
    http: Client,
    base_url: String,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn unexpected(res: reqwest::Response) -> RelayError {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        RelayError::Status { status, body }
    }
}

#[async_trait]
impl SignalRelay for HttpRelay {
    async fn publish(&self, room: &str, signal: Signal) -> Result<u64, RelayError> {
        let url = format!("{}{}", self.base_url, SIGNAL_PATH);
        let body = PublishRequest {
            room_code: room.to_string(),
            signal: signal.into(),
        };
        let res = self.http.post(url).json(&body).send().await?;
        match res.status() {
            status if status.is_success() => Ok(res.json::<PublishResponse>().await?.timestamp),
            StatusCode::GONE => Err(RelayError::RoomGone(room.to_string())),
            StatusCode::BAD_REQUEST => {
                let body = res.text().await.unwrap_or_default();
                Err(RelayError::InvalidSignal(body))
            }
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn fetch_since(&self, room: &str, watermark: u64) -> Result<Vec<Signal>, RelayError> {
        let url = format!("{}{}", self.base_url, SIGNAL_PATH);
        let since = watermark.to_string();
        let res = self
            .http
            .get(url)
            .query(&[("roomCode", room), ("since", since.as_str())])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::unexpected(res).await);
        }
        let body = res.json::<FetchResponse>().await?;
        let mut signals: Vec<Signal> = body
            .signals
            .into_iter()
            .filter_map(|value| match Signal::from_value(value) {
                Ok(signal) => Some(signal),
                Err(err) => {
                    debug!(room = %room, error = %err, "dropping undecodable signal from relay");
                    None
                }
            })
            .filter(|signal| signal.timestamp > watermark)
            .collect();
        signals.sort_by_key(|signal| signal.timestamp);
        Ok(signals)
    }

    async fn room_exists(&self, room: &str) -> Result<bool, RelayError> {
        let url = format!("{}{}", self.base_url, ROOM_EXISTS_PATH);
        let res = self.http.get(url).query(&[("roomCode", room)]).send().await?;
        if res.status().is_success() {
            Ok(res.json::<RoomExistsResponse>().await?.exists)
        } else {
            Err(Self::unexpected(res).await)
        }
    }
}
