//! HTTP client for the controller API.
//!
//! Everything the agent sends upstream goes through here: capture uploads,
//! blocklist and peer-gateway fetches, and recording uploads. The scheduler
//! talks to the [`UploadSink`] trait so tests can swap in an in-process sink.

use crate::capture::{Frame, ImageTranscoder};
use crate::config::AgentConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::prelude::*;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Where one upload goes, snapshotted from the config at job start so a
/// mid-flight config change cannot split a request across servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub server_address: String,
    pub api_port: u16,
}

impl UploadTarget {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            server_address: config.server_address.clone(),
            api_port: config.api_port,
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.server_address, self.api_port, path)
    }

    pub fn upload_url(&self) -> String {
        self.endpoint("/client/upload")
    }
}

/// One transcoded image in an upload payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEntry {
    pub name: String,
    pub format: String,
    pub encoded: String,
    pub checksum: String,
    pub size: usize,
}

/// Device metadata attached to every upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub device_id: String,
    #[serde(default)]
    pub user_id: String,
    pub username: String,
    pub local_ip: String,
    pub active: bool,
    pub registered: bool,
    pub captured_at: String,
}

/// Complete upload body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPayload {
    pub count: usize,
    pub images: Vec<CaptureEntry>,
    pub metadata: UploadMetadata,
}

/// Transcode frames and assemble the upload payload. Image names follow the
/// controller's `screen0..n` convention; each entry carries a sha256
/// checksum of the transcoded bytes.
pub fn encode_payload(
    frames: &[Frame],
    transcoder: &dyn ImageTranscoder,
    metadata: UploadMetadata,
) -> Result<UploadPayload> {
    let mut images = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let bytes = transcoder
            .transcode(frame)
            .with_context(|| format!("failed to transcode frame {}", frame.display_id))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        images.push(CaptureEntry {
            name: format!("screen{}", index),
            format: transcoder.format().to_string(),
            encoded: BASE64_STANDARD.encode(&bytes),
            checksum: format!("{:x}", hasher.finalize()),
            size: bytes.len(),
        });
    }
    Ok(UploadPayload {
        count: images.len(),
        images,
        metadata,
    })
}

/// Destination for assembled upload payloads. The production implementation
/// is [`ControllerClient`]; tests use counting sinks.
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn upload(&self, target: &UploadTarget, payload: &UploadPayload) -> Result<()>;
}

/// One blocked site entry from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedSite {
    pub url: String,
    #[serde(default = "default_redirect")]
    pub redirect: String,
}

fn default_redirect() -> String {
    "127.0.0.1".to_string()
}

/// Versioned blocklist as served by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocklist {
    pub version: u64,
    #[serde(default)]
    pub blocklist: Vec<BlockedSite>,
}

/// One addressable peer gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerGateway {
    #[serde(default)]
    pub name: Option<String>,
    pub ip: String,
}

/// HTTP client for the controller API.
pub struct ControllerClient {
    client: Client,
}

impl ControllerClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client })
    }

    /// Upload a capture payload. Any transport error or non-2xx response is
    /// a failure; the caller decides what to do with it.
    pub async fn upload_captures(
        &self,
        target: &UploadTarget,
        payload: &UploadPayload,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload).context("failed to encode upload payload")?;
        let compressed = compress_body(&body)?;
        debug!(
            url = %target.upload_url(),
            images = payload.count,
            bytes = compressed.len(),
            "uploading captures"
        );

        let metadata = &payload.metadata;
        let response = self
            .client
            .post(target.upload_url())
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .header("X-DeviceId", &metadata.device_id)
            .header("X-UserId", &metadata.user_id)
            .header("X-Username", &metadata.username)
            .header("X-Active", if metadata.active { "true" } else { "false" })
            .header("X-LocalIP", &metadata.local_ip)
            .body(compressed)
            .send()
            .await
            .context("failed to send upload request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("upload failed with status {}: {}", status, body));
        }
        Ok(())
    }

    /// Fetch the current site blocklist.
    pub async fn fetch_blocklist(&self, target: &UploadTarget) -> Result<Blocklist> {
        let url = target.endpoint("/client/blocklist");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch blocklist from {}", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("blocklist fetch failed with status {}", status));
        }
        response
            .json::<Blocklist>()
            .await
            .context("failed to decode blocklist response")
    }

    /// Fetch the addressable peer gateways for this device.
    pub async fn fetch_peer_gateways(
        &self,
        target: &UploadTarget,
        device_id: &str,
    ) -> Result<Vec<PeerGateway>> {
        let url = target.endpoint("/client/routers");
        let response = self
            .client
            .get(&url)
            .header("X-DeviceId", device_id)
            .send()
            .await
            .with_context(|| format!("failed to fetch peer gateways from {}", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("peer gateway fetch failed with status {}", status));
        }
        response
            .json::<Vec<PeerGateway>>()
            .await
            .context("failed to decode peer gateway response")
    }

    /// Upload a finished audio recording as a multipart form.
    pub async fn upload_recording(
        &self,
        target: &UploadTarget,
        path: &Path,
        duration: Duration,
        device_id: &str,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read recording {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("recording.mov")
            .to_string();

        // The controller expects the audio under a `file` form field.
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mov")
            .context("failed to build recording part")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = target.endpoint("/client/recording");
        let response = self
            .client
            .post(&url)
            .header(
                "X-Audio-Duration",
                format!("{:.2}", duration.as_secs_f64()),
            )
            .header("X-Mac-Address", device_id)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to upload recording to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("recording upload failed with status {}", status));
        }
        Ok(())
    }
}

#[async_trait]
impl UploadSink for ControllerClient {
    async fn upload(&self, target: &UploadTarget, payload: &UploadPayload) -> Result<()> {
        self.upload_captures(target, payload).await
    }
}

fn compress_body(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish().context("failed to compress upload body")
}
