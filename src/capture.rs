//! Screen capture providers and the upload transcoder.
//!
//! Screen acquisition stays behind [`CaptureProvider`]: production runs an
//! external command that writes an image file, tests and dry runs use the
//! deterministic synthetic provider. Frames pass through an
//! [`ImageTranscoder`] before they are encoded into an upload payload.

use crate::config::CaptureSettings;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// One captured frame, bytes exactly as the provider produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub display_id: String,
    pub data: Vec<u8>,
}

/// Source of captured frames.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Capture one frame per display. An empty result means nothing to
    /// upload this cycle.
    async fn capture(&self) -> Result<Vec<Frame>>;
}

/// Platform default capture command with the `{output}` placeholder, or
/// `None` when the platform has no known command.
pub fn default_capture_command() -> Option<String> {
    if cfg!(target_os = "macos") {
        Some("screencapture -x -t png {output}".to_string())
    } else if cfg!(target_os = "linux") {
        Some("import -silent -window root {output}".to_string())
    } else {
        None
    }
}

/// Captures by running an external command that writes an image into a
/// temporary file.
pub struct CommandCaptureProvider {
    command: String,
}

impl CommandCaptureProvider {
    pub fn new(command: String) -> Self {
        Self { command }
    }

    /// Build from capture settings, falling back to the platform default
    /// command.
    pub fn from_settings(settings: &CaptureSettings) -> Result<Self> {
        let command = settings
            .command
            .clone()
            .or_else(default_capture_command)
            .context("no capture command configured and no platform default available")?;
        Ok(Self::new(command))
    }
}

#[async_trait]
impl CaptureProvider for CommandCaptureProvider {
    async fn capture(&self) -> Result<Vec<Frame>> {
        let output = tempfile::Builder::new()
            .prefix("outpost-capture-")
            .suffix(".png")
            .tempfile()
            .context("failed to create capture output file")?;
        let output_path = output.path().display().to_string();

        let rendered = self.command.replace("{output}", &output_path);
        let parts = shlex::split(&rendered)
            .with_context(|| format!("failed to parse capture command: {}", rendered))?;
        let (program, args) = parts
            .split_first()
            .context("capture command is empty")?;

        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to run capture command: {}", program))?;
        if !status.success() {
            bail!("capture command exited with {}", status);
        }

        let data = tokio::fs::read(output.path())
            .await
            .context("failed to read captured image")?;
        if data.is_empty() {
            bail!("capture command produced an empty image");
        }

        debug!(bytes = data.len(), "captured frame");
        Ok(vec![Frame {
            display_id: "display-0".to_string(),
            data,
        }])
    }
}

/// Deterministic in-memory provider for tests and offline runs. Frame
/// contents vary with an internal sequence number so consecutive captures
/// are distinguishable.
pub struct SyntheticCaptureProvider {
    displays: usize,
    frame_len: usize,
    sequence: AtomicU64,
}

impl SyntheticCaptureProvider {
    pub fn new(displays: usize, frame_len: usize) -> Self {
        Self {
            displays,
            frame_len,
            sequence: AtomicU64::new(0),
        }
    }

    /// Number of capture calls served so far.
    pub fn captures_served(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CaptureProvider for SyntheticCaptureProvider {
    async fn capture(&self) -> Result<Vec<Frame>> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frames = (0..self.displays)
            .map(|display| Frame {
                display_id: format!("display-{}", display),
                data: vec![((sequence + display as u64) % 251) as u8; self.frame_len],
            })
            .collect();
        Ok(frames)
    }
}

/// Transforms a raw frame into the representation that gets uploaded.
pub trait ImageTranscoder: Send + Sync {
    fn transcode(&self, frame: &Frame) -> Result<Vec<u8>>;
    /// Format label recorded in the upload payload.
    fn format(&self) -> &'static str;
}

/// Gzip transcoder used for uploads.
pub struct GzipTranscoder {
    level: u32,
}

impl GzipTranscoder {
    /// Levels above 9 are clamped to 9.
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for GzipTranscoder {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ImageTranscoder for GzipTranscoder {
    fn transcode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(&frame.data)
            .context("failed to compress frame")?;
        encoder.finish().context("failed to finish frame compression")
    }

    fn format(&self) -> &'static str {
        "gzip"
    }
}
