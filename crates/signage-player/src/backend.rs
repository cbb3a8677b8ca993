//! Backend seam: pairing activation, playlist fetch, change feed, liveness.
//!
//! `HttpBackend` talks to the hosted backend over HTTP; the change feed is a
//! long-lived response body carrying one JSON document per line.  The feed is
//! handed to the synchronizer as raw text frames so a malformed frame can be
//! dropped on its own.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use signage_proto::config::BackendConfig;
use signage_proto::protocol::{DeviceIdentity, PlaylistRecord};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pairing::{PairingCode, PairingError};

pub mod memory;

/// Raw change-feed frames, one per event.
pub type FrameStream = BoxStream<'static, Result<String, BackendError>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Activate the inactive device registered under `code`.
    async fn activate(&self, code: &PairingCode) -> Result<DeviceIdentity, PairingError>;

    /// Full ordered playlist for the device.
    async fn fetch_playlist(
        &self,
        device: &DeviceIdentity,
    ) -> Result<Vec<PlaylistRecord>, BackendError>;

    /// Open the live change feed for the device.
    async fn subscribe(&self, device: &DeviceIdentity) -> Result<FrameStream, BackendError>;

    async fn heartbeat(&self, device: &DeviceIdentity) -> Result<(), BackendError>;

    /// Best-effort "going away" notice sent on shutdown.
    async fn set_offline(&self, device: &DeviceIdentity) -> Result<(), BackendError>;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct ActivateRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize)]
struct ActivateResponse {
    device_id: String,
    device_name: String,
}

#[derive(Serialize)]
struct StatusUpdate<'a> {
    status: &'a str,
    last_seen: chrono::DateTime<chrono::Utc>,
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    timeout: std::time::Duration,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| anyhow::anyhow!("invalid backend url '{}': {}", config.base_url, e))?;
        // No overall timeout on the client: the change feed is long-lived.
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            timeout: config.request_timeout(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Unavailable(format!("bad base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        if self.api_key.is_empty() {
            builder
        } else {
            builder
                .header("apikey", &self.api_key)
                .bearer_auth(&self.api_key)
        }
    }

    async fn post_status(
        &self,
        device: &DeviceIdentity,
        path: &str,
        status: &str,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&["devices", &device.device_id, path])?;
        let response = self
            .request(Method::POST, url)
            .timeout(self.timeout)
            .json(&StatusUpdate {
                status,
                last_seen: chrono::Utc::now(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

fn classify_activation_status(status: StatusCode) -> PairingError {
    match status {
        StatusCode::NOT_FOUND => PairingError::CodeNotFound,
        StatusCode::CONFLICT => PairingError::AlreadyActive,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            PairingError::NetworkFailure(format!("HTTP {}", status.as_u16()))
        }
        s if s.is_server_error() => PairingError::NetworkFailure(format!("HTTP {}", s.as_u16())),
        s => PairingError::Unexpected(format!("HTTP {}", s.as_u16())),
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn activate(&self, code: &PairingCode) -> Result<DeviceIdentity, PairingError> {
        let url = self
            .endpoint(&["devices", "activate"])
            .map_err(|e| PairingError::Unexpected(e.to_string()))?;
        let response = self
            .request(Method::POST, url)
            .timeout(self.timeout)
            .json(&ActivateRequest {
                code: code.as_str(),
            })
            .send()
            .await
            .map_err(|e| PairingError::NetworkFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(classify_activation_status(response.status()));
        }

        let body: ActivateResponse = response
            .json()
            .await
            .map_err(|e| PairingError::Unexpected(format!("bad activation response: {}", e)))?;

        Ok(DeviceIdentity {
            device_id: body.device_id,
            device_name: body.device_name,
            pairing_code: code.as_str().to_string(),
        })
    }

    async fn fetch_playlist(
        &self,
        device: &DeviceIdentity,
    ) -> Result<Vec<PlaylistRecord>, BackendError> {
        let url = self.endpoint(&["devices", &device.device_id, "playlist"])?;
        let response = self
            .request(Method::GET, url)
            .timeout(self.timeout)
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn subscribe(&self, device: &DeviceIdentity) -> Result<FrameStream, BackendError> {
        let url = self.endpoint(&["devices", &device.device_id, "playlist", "changes"])?;
        let response = self
            .request(Method::GET, url)
            .header("Accept", "application/x-ndjson")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }
        debug!("backend: change feed open for {}", device.device_id);
        Ok(ndjson_frames(response.bytes_stream()))
    }

    async fn heartbeat(&self, device: &DeviceIdentity) -> Result<(), BackendError> {
        self.post_status(device, "heartbeat", "active").await
    }

    async fn set_offline(&self, device: &DeviceIdentity) -> Result<(), BackendError> {
        self.post_status(device, "status", "offline").await
    }
}

// ── NDJSON framing ────────────────────────────────────────────────────────────

/// Longest change-feed line accepted.  Longer lines are dropped whole.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

struct LineState<S> {
    inner: Pin<Box<S>>,
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a newline.
    scanned: usize,
    /// Inside an oversize line; everything up to the next newline is dropped.
    discarding: bool,
    done: bool,
}

fn frame_text(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Split a byte stream into trimmed, non-empty text lines.  Blank lines
/// (keep-alives) are skipped, lines over `MAX_FRAME_LEN` are dropped with a
/// warning, and a transport error ends the stream after being yielded once.
pub fn ndjson_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<BackendError> + Send + 'static,
{
    let state = LineState {
        inner: Box::pin(bytes),
        buf: Vec::new(),
        scanned: 0,
        discarding: false,
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            let newline = st.buf[st.scanned..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let pos = st.scanned + offset;
                    let line: Vec<u8> = st.buf.drain(..=pos).collect();
                    st.scanned = 0;
                    if std::mem::take(&mut st.discarding) {
                        continue;
                    }
                    if line.len() > MAX_FRAME_LEN {
                        warn!("backend: dropping {} byte change-feed frame", line.len());
                        continue;
                    }
                    if let Some(text) = frame_text(&line) {
                        return Some((Ok(text), st));
                    }
                    continue;
                }
                None if st.discarding || st.buf.len() > MAX_FRAME_LEN => {
                    if !st.discarding {
                        warn!(
                            "backend: change-feed frame exceeds {} bytes, skipping to next line",
                            MAX_FRAME_LEN
                        );
                    }
                    st.discarding = true;
                    st.buf.clear();
                    st.scanned = 0;
                }
                None => st.scanned = st.buf.len(),
            }
            if st.done {
                let rest = std::mem::take(&mut st.buf);
                if st.discarding {
                    return None;
                }
                return frame_text(&rest).map(|text| (Ok(text), st));
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    st.done = true;
                    st.discarding = false;
                    st.buf.clear();
                    st.scanned = 0;
                    return Some((Err(e.into()), st));
                }
                None => st.done = true,
            }
        }
    })
    .boxed()
}
