//! Agent configuration and the shared configuration store.
//!
//! Startup values come from an optional config file in the config directory.
//! After startup the controller pushes changes over the config sync channel;
//! every applied change goes through [`ConfigStore::replace`], so readers
//! always observe a complete snapshot and never a half-applied update.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Protocol version compiled into this build, compared against the version
/// the controller announces.
pub const LOCAL_PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_capture_interval_ms() -> u64 {
    60_000
}

fn default_control_port() -> u16 {
    8484
}

fn default_approval_port() -> u16 {
    8485
}

fn default_metrics_port() -> u16 {
    8000
}

fn default_protocol_version() -> String {
    LOCAL_PROTOCOL_VERSION.to_string()
}

fn default_approval_timeout_secs() -> u64 {
    20
}

fn default_compression_level() -> u32 {
    6
}

fn default_activity_cpu_threshold() -> f32 {
    5.0
}

fn default_silence_window() -> u32 {
    5
}

fn default_level_threshold_db() -> f32 {
    -50.0
}

/// Capture pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// External capture command with an `{output}` placeholder for the
    /// image path. Falls back to a platform default when unset.
    #[serde(default)]
    pub command: Option<String>,
    /// Transcoder compression level (0-9).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Global CPU usage (percent) above which the machine is reported
    /// active in upload metadata.
    #[serde(default = "default_activity_cpu_threshold")]
    pub activity_cpu_threshold: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            command: None,
            compression_level: default_compression_level(),
            activity_cpu_threshold: default_activity_cpu_threshold(),
        }
    }
}

/// Audio recording settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderSettings {
    /// Whether the microphone monitor and recorder run at all.
    #[serde(default)]
    pub enabled: bool,
    /// Recorder command with an `{output}` placeholder for the audio path.
    #[serde(default)]
    pub command: Option<String>,
    /// Microphone level probe command; its stderr is scanned for RMS levels.
    #[serde(default)]
    pub monitor_command: Option<String>,
    /// Consecutive quiet samples before an active recording is stopped.
    #[serde(default = "default_silence_window")]
    pub silence_window: u32,
    /// RMS dB floor above which the microphone counts as in use.
    #[serde(default = "default_level_threshold_db")]
    pub level_threshold_db: f32,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: None,
            monitor_command: None,
            silence_window: default_silence_window(),
            level_threshold_db: default_level_threshold_db(),
        }
    }
}

/// Complete agent configuration.
///
/// The controller can remotely change the server address, API port, capture
/// interval and protocol version; everything else is local and survives
/// remote updates because merging always starts from the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Controller address used for uploads and approval requests.
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Controller HTTP API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Capture period in milliseconds. Must be greater than zero.
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,
    /// UDP port the config sync channel listens on.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Controller UDP port approval requests are sent to.
    #[serde(default = "default_approval_port")]
    pub approval_port: u16,
    /// Protocol version last announced by the controller. Starts at the
    /// local build version.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// HTTP port for the metrics/status endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Seconds to wait for an approval response before denying.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    /// Operator-assigned identifier forwarded with uploads.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Capture pipeline settings.
    #[serde(default)]
    pub capture: CaptureSettings,
    /// Audio recording settings.
    #[serde(default)]
    pub recorder: RecorderSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            api_port: default_api_port(),
            capture_interval_ms: default_capture_interval_ms(),
            control_port: default_control_port(),
            approval_port: default_approval_port(),
            protocol_version: default_protocol_version(),
            metrics_port: default_metrics_port(),
            approval_timeout_secs: default_approval_timeout_secs(),
            user_id: None,
            capture: CaptureSettings::default(),
            recorder: RecorderSettings::default(),
        }
    }
}

impl AgentConfig {
    /// Validate configuration values before the agent starts.
    pub fn validate(&self) -> Result<()> {
        if self.server_address.is_empty() {
            bail!("server_address cannot be empty");
        }
        if self.capture_interval_ms == 0 {
            bail!("capture_interval_ms must be greater than 0");
        }
        if self.api_port == 0 {
            bail!("api_port must be greater than 0");
        }
        if self.approval_port == 0 {
            bail!("approval_port must be greater than 0");
        }
        if self.approval_timeout_secs == 0 {
            bail!("approval_timeout_secs must be greater than 0");
        }
        if self.capture.compression_level > 9 {
            bail!(
                "capture.compression_level must be 0-9, got {}",
                self.capture.compression_level
            );
        }
        Ok(())
    }
}

/// Shared, atomically replaceable configuration.
///
/// Readers take a cloned snapshot; the only mutation is a whole-struct swap
/// under the write lock. Clones share the same underlying store.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<AgentConfig>>,
}

impl ConfigStore {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Return a consistent snapshot of the current configuration.
    pub fn get(&self) -> AgentConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new configuration. Readers see either the old snapshot or
    /// the new one, never a mixture.
    pub fn replace(&self, next: AgentConfig) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// One inbound configuration update, field names as the controller sends
/// them. Absent fields leave the corresponding values untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "SERVER_IP_ADDRESS")]
    pub server_address: Option<String>,
    #[serde(rename = "CLIENT_API_PORT")]
    pub api_port: Option<u16>,
    #[serde(rename = "CLIENT_SCREENSHOT_INTERVAL")]
    pub capture_interval_ms: Option<u64>,
    #[serde(rename = "CLIENT_APP_VERSION")]
    pub protocol_version: Option<String>,
    /// Device ids the controller has released. Each message is a complete
    /// snapshot: a device absent from the list (or an absent list) counts
    /// as registered.
    #[serde(rename = "freeLaptops")]
    pub freed_devices: Option<Vec<String>>,
}

impl ConfigUpdate {
    /// Decode one datagram. Returns `None` for anything that does not parse
    /// into a usable update; callers drop those silently.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let update: ConfigUpdate = serde_json::from_slice(bytes).ok()?;
        if !update.is_valid() {
            return None;
        }
        Some(update)
    }

    fn is_valid(&self) -> bool {
        if self.capture_interval_ms == Some(0) {
            return false;
        }
        if self.api_port == Some(0) {
            return false;
        }
        if matches!(self.server_address.as_deref(), Some("")) {
            return false;
        }
        true
    }

    /// Whether this update declares the given device as released.
    pub fn frees_device(&self, device_id: &str) -> bool {
        self.freed_devices
            .as_ref()
            .is_some_and(|ids| ids.iter().any(|id| id == device_id))
    }
}

/// Which externally visible values an applied update actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDelta {
    pub server_changed: bool,
    pub interval_changed: bool,
    pub api_port_changed: bool,
    pub version_changed: bool,
}

impl ConfigDelta {
    pub fn any(&self) -> bool {
        self.server_changed || self.interval_changed || self.api_port_changed || self.version_changed
    }
}

/// Merge an update into the current snapshot: present fields replace, absent
/// fields carry over. Returns the merged snapshot and the delta against
/// `current`.
pub fn merge_update(current: &AgentConfig, update: &ConfigUpdate) -> (AgentConfig, ConfigDelta) {
    let mut next = current.clone();
    if let Some(address) = &update.server_address {
        next.server_address = address.clone();
    }
    if let Some(port) = update.api_port {
        next.api_port = port;
    }
    if let Some(interval) = update.capture_interval_ms {
        next.capture_interval_ms = interval;
    }
    if let Some(version) = &update.protocol_version {
        next.protocol_version = version.clone();
    }

    let delta = ConfigDelta {
        server_changed: next.server_address != current.server_address,
        interval_changed: next.capture_interval_ms != current.capture_interval_ms,
        api_port_changed: next.api_port != current.api_port,
        version_changed: next.protocol_version != current.protocol_version,
    };

    (next, delta)
}

/// Load the agent configuration from the config directory.
///
/// Looks for `agent.yml`, `agent.yaml`, `agent.json`, or `agent.toml`, in
/// that order. Missing files mean defaults.
pub fn load_agent_config(config_dir: &Path) -> Result<AgentConfig> {
    for name in ["agent.yml", "agent.yaml", "agent.json", "agent.toml"] {
        let path = config_dir.join(name);
        if !path.exists() {
            continue;
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") | Some("yaml") => serde_yaml::from_str(&contents)
                .with_context(|| format!("invalid YAML in {}", path.display()))?,
            Some("json") => serde_json::from_str(&contents)
                .with_context(|| format!("invalid JSON in {}", path.display()))?,
            Some("toml") => toml::from_str(&contents)
                .with_context(|| format!("invalid TOML in {}", path.display()))?,
            _ => continue,
        };

        return Ok(config);
    }

    Ok(AgentConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.server_address, "127.0.0.1");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.capture_interval_ms, 60_000);
        assert_eq!(config.approval_timeout_secs, 20);
        assert_eq!(config.protocol_version, LOCAL_PROTOCOL_VERSION);
        assert!(!config.recorder.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.capture_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.server_address = String::new();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.capture.compression_level = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_snapshot_and_replace() {
        let store = ConfigStore::new(AgentConfig::default());
        let mut next = store.get();
        next.api_port = 9999;
        store.replace(next);
        assert_eq!(store.get().api_port, 9999);
        // Other fields survive the swap untouched.
        assert_eq!(store.get().capture_interval_ms, 60_000);
    }

    #[test]
    fn test_store_snapshots_are_never_torn() {
        // Writers keep api_port == capture_interval_ms / 10; a torn read
        // would break the pairing.
        let store = ConfigStore::new(AgentConfig::default());
        let mut seed = AgentConfig::default();
        seed.api_port = 100;
        seed.capture_interval_ms = 1000;
        store.replace(seed);

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 1u64..500 {
                    let mut next = store.get();
                    next.api_port = (100 + i) as u16;
                    next.capture_interval_ms = (100 + i) * 10;
                    store.replace(next);
                }
            })
        };

        for _ in 0..500 {
            let snapshot = store.get();
            assert_eq!(u64::from(snapshot.api_port) * 10, snapshot.capture_interval_ms);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_decode_update_wire_names() {
        let raw = br#"{
            "SERVER_IP_ADDRESS": "10.0.0.2",
            "CLIENT_API_PORT": 9000,
            "CLIENT_SCREENSHOT_INTERVAL": 5000,
            "CLIENT_APP_VERSION": "2.1.0",
            "freeLaptops": ["aa:bb:cc:dd:ee:ff"]
        }"#;
        let update = ConfigUpdate::decode(raw).unwrap();
        assert_eq!(update.server_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(update.api_port, Some(9000));
        assert_eq!(update.capture_interval_ms, Some(5000));
        assert_eq!(update.protocol_version.as_deref(), Some("2.1.0"));
        assert!(update.frees_device("aa:bb:cc:dd:ee:ff"));
        assert!(!update.frees_device("11:22:33:44:55:66"));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(ConfigUpdate::decode(b"not json at all").is_none());
        assert!(ConfigUpdate::decode(b"").is_none());
        assert!(ConfigUpdate::decode(b"[1,2,3]").is_none());
        // Wrong type for a known field fails the typed parse.
        assert!(ConfigUpdate::decode(br#"{"CLIENT_API_PORT": "eighty"}"#).is_none());
        // Parseable but unusable values are rejected too.
        assert!(ConfigUpdate::decode(br#"{"CLIENT_SCREENSHOT_INTERVAL": 0}"#).is_none());
        assert!(ConfigUpdate::decode(br#"{"SERVER_IP_ADDRESS": ""}"#).is_none());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let update = ConfigUpdate::decode(br#"{"SOME_FUTURE_FIELD": true}"#).unwrap();
        assert!(update.server_address.is_none());
        assert!(update.api_port.is_none());
        assert!(update.freed_devices.is_none());
    }

    #[test]
    fn test_merge_preserves_absent_fields() {
        let mut current = AgentConfig::default();
        current.capture_interval_ms = 5000;
        current.api_port = 80;

        let update = ConfigUpdate::decode(br#"{"CLIENT_API_PORT": 81}"#).unwrap();
        let (merged, delta) = merge_update(&current, &update);

        assert_eq!(merged.api_port, 81);
        assert_eq!(merged.capture_interval_ms, 5000);
        assert_eq!(merged.server_address, current.server_address);
        assert!(delta.api_port_changed);
        assert!(!delta.interval_changed);
        assert!(!delta.server_changed);
    }

    #[test]
    fn test_merge_no_op_produces_empty_delta() {
        let current = AgentConfig::default();
        let update = ConfigUpdate {
            server_address: Some(current.server_address.clone()),
            api_port: Some(current.api_port),
            capture_interval_ms: Some(current.capture_interval_ms),
            protocol_version: Some(current.protocol_version.clone()),
            freed_devices: None,
        };
        let (merged, delta) = merge_update(&current, &update);
        assert_eq!(merged, current);
        assert!(!delta.any());
    }

    #[test]
    fn test_merge_local_settings_survive() {
        let mut current = AgentConfig::default();
        current.recorder.enabled = true;
        current.capture.compression_level = 9;

        let update = ConfigUpdate::decode(br#"{"SERVER_IP_ADDRESS": "10.1.1.1"}"#).unwrap();
        let (merged, delta) = merge_update(&current, &update);

        assert!(delta.server_changed);
        assert!(merged.recorder.enabled);
        assert_eq!(merged.capture.compression_level, 9);
    }

    #[test]
    fn test_load_yaml_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("agent.yml");

        let yaml_content = r#"
server_address: "192.168.1.50"
api_port: 8443
capture_interval_ms: 30000
capture:
  compression_level: 9
recorder:
  enabled: true
  silence_window: 8
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let config = load_agent_config(temp_dir.path()).unwrap();
        assert_eq!(config.server_address, "192.168.1.50");
        assert_eq!(config.api_port, 8443);
        assert_eq!(config.capture_interval_ms, 30_000);
        assert_eq!(config.capture.compression_level, 9);
        assert!(config.recorder.enabled);
        assert_eq!(config.recorder.silence_window, 8);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.control_port, 8484);
    }

    #[test]
    fn test_load_json_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("agent.json");

        let json_content = r#"{
            "server_address": "172.16.0.9",
            "approval_timeout_secs": 5,
            "user_id": "operator-7"
        }"#;
        fs::write(&config_path, json_content).unwrap();

        let config = load_agent_config(temp_dir.path()).unwrap();
        assert_eq!(config.server_address, "172.16.0.9");
        assert_eq!(config.approval_timeout_secs, 5);
        assert_eq!(config.user_id.as_deref(), Some("operator-7"));
    }

    #[test]
    fn test_load_toml_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("agent.toml");

        let toml_content = r#"
server_address = "10.9.8.7"
metrics_port = 9100

[capture]
command = "grim {output}"
"#;
        fs::write(&config_path, toml_content).unwrap();

        let config = load_agent_config(temp_dir.path()).unwrap();
        assert_eq!(config.server_address, "10.9.8.7");
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.capture.command.as_deref(), Some("grim {output}"));
    }

    #[test]
    fn test_load_missing_config_returns_default() {
        let temp_dir = tempdir().unwrap();
        let config = load_agent_config(temp_dir.path()).unwrap();
        assert_eq!(config, AgentConfig::default());
    }
}
