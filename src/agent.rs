//! Agent mode implementation
//!
//! Runs the long-lived control loop: the UDP config sync channel, the
//! capture/upload scheduler, the approval-gated audio recorder, and the
//! metrics/status HTTP endpoint.

use crate::approval::ApprovalCoordinator;
use crate::capture::{CaptureProvider, CommandCaptureProvider, GzipTranscoder, ImageTranscoder};
use crate::config::{AgentConfig, ConfigDelta, ConfigStore, LOCAL_PROTOCOL_VERSION};
use crate::controller::{ControllerClient, UploadSink, UploadTarget};
use crate::hosts;
use crate::identity::DeviceIdentity;
use crate::recorder::{run_mic_monitor, AudioRecorder, MicTransition};
use crate::scheduler::CaptureUploadScheduler;
use crate::status::{AgentStatus, Registration, VersionMatch};
use crate::sync::ConfigSyncChannel;
use anyhow::{anyhow, Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, instrument, warn};

/// Counters registered with the agent's metrics registry. Clones share the
/// underlying counters.
#[derive(Clone)]
pub struct AgentCounters {
    pub captures: IntCounter,
    pub upload_failures: IntCounter,
    pub skipped_ticks: IntCounter,
    pub config_updates: IntCounter,
    pub approvals_granted: IntCounter,
    pub approvals_denied: IntCounter,
}

impl AgentCounters {
    /// Standalone counters, not attached to any registry.
    pub fn new() -> Result<Self> {
        Ok(Self {
            captures: IntCounter::new(
                "outpost_captures_total",
                "Capture/upload cycles completed successfully",
            )?,
            upload_failures: IntCounter::new(
                "outpost_upload_failures_total",
                "Capture/upload cycles that failed",
            )?,
            skipped_ticks: IntCounter::new(
                "outpost_skipped_ticks_total",
                "Scheduler ticks dropped because a job was still in flight",
            )?,
            config_updates: IntCounter::new(
                "outpost_config_updates_total",
                "Remote configuration changes applied",
            )?,
            approvals_granted: IntCounter::new(
                "outpost_approvals_granted_total",
                "Recording approvals the controller granted",
            )?,
            approvals_denied: IntCounter::new(
                "outpost_approvals_denied_total",
                "Recording approvals denied, timed out or failed to send",
            )?,
        })
    }

    /// Counters registered with the given metrics registry.
    pub fn registered(registry: &Registry) -> Result<Self> {
        let counters = Self::new()?;
        registry.register(Box::new(counters.captures.clone()))?;
        registry.register(Box::new(counters.upload_failures.clone()))?;
        registry.register(Box::new(counters.skipped_ticks.clone()))?;
        registry.register(Box::new(counters.config_updates.clone()))?;
        registry.register(Box::new(counters.approvals_granted.clone()))?;
        registry.register(Box::new(counters.approvals_denied.clone()))?;
        Ok(counters)
    }
}

/// Agent that owns the config store, the sync channel, the capture
/// scheduler and the recorder supervisor.
pub struct Agent {
    store: ConfigStore,
    status: Arc<AgentStatus>,
    identity: DeviceIdentity,
    client: Arc<ControllerClient>,
    approvals: Arc<ApprovalCoordinator>,
    scheduler: CaptureUploadScheduler,
    counters: AgentCounters,
    metrics_registry: Registry,
    deltas: mpsc::Receiver<ConfigDelta>,
    delta_feed: mpsc::Sender<ConfigDelta>,
    hosts_path: PathBuf,
    sync_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
    sync_handle: Option<JoinHandle<()>>,
    metrics_server_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
    recorder_handle: Option<JoinHandle<()>>,
    running: bool,
}

impl Agent {
    /// Create an agent with the default pipeline: the platform capture
    /// command, gzip transcoding and HTTP uploads to the controller.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let provider: Arc<dyn CaptureProvider> =
            Arc::new(CommandCaptureProvider::from_settings(&config.capture)?);
        let transcoder: Arc<dyn ImageTranscoder> =
            Arc::new(GzipTranscoder::new(config.capture.compression_level));
        let client = Arc::new(ControllerClient::new()?);
        let sink: Arc<dyn UploadSink> = Arc::clone(&client) as Arc<dyn UploadSink>;
        Self::assemble(config, provider, transcoder, sink, client)
    }

    /// Create an agent around an injected capture pipeline.
    pub fn with_pipeline(
        config: AgentConfig,
        provider: Arc<dyn CaptureProvider>,
        transcoder: Arc<dyn ImageTranscoder>,
        sink: Arc<dyn UploadSink>,
    ) -> Result<Self> {
        let client = Arc::new(ControllerClient::new()?);
        Self::assemble(config, provider, transcoder, sink, client)
    }

    /// Override the hosts file the blocklist is applied to. Useful when the
    /// agent runs without privileges over the system file.
    pub fn with_hosts_path(mut self, path: PathBuf) -> Self {
        self.hosts_path = path;
        self
    }

    fn assemble(
        config: AgentConfig,
        provider: Arc<dyn CaptureProvider>,
        transcoder: Arc<dyn ImageTranscoder>,
        sink: Arc<dyn UploadSink>,
        client: Arc<ControllerClient>,
    ) -> Result<Self> {
        config.validate()?;

        let identity = DeviceIdentity::collect();
        let store = ConfigStore::new(config.clone());
        let status = Arc::new(AgentStatus::new());
        let metrics_registry = Registry::new();
        let counters = AgentCounters::registered(&metrics_registry)?;
        let approvals = Arc::new(ApprovalCoordinator::new(store.clone()));
        let (delta_feed, deltas) = mpsc::channel(16);

        let scheduler = CaptureUploadScheduler::new(
            Duration::from_millis(config.capture_interval_ms),
            provider,
            transcoder,
            sink,
            store.clone(),
            Arc::clone(&status),
            identity.clone(),
            counters.clone(),
        );

        Ok(Self {
            store,
            status,
            identity,
            client,
            approvals,
            scheduler,
            counters,
            metrics_registry,
            deltas,
            delta_feed,
            hosts_path: hosts::hosts_path(),
            sync_addr: None,
            metrics_addr: None,
            sync_handle: None,
            metrics_server_handle: None,
            monitor_handle: None,
            recorder_handle: None,
            running: false,
        })
    }

    /// Start the agent: bind the sync channel, bring up the metrics server
    /// and kick off the background pipelines.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(anyhow!("agent is already running"));
        }

        let config = self.store.get();
        info!(
            version = LOCAL_PROTOCOL_VERSION,
            device = %self.identity.mac_address,
            server = %config.server_address,
            "starting outpost agent"
        );

        let version_match = if config.protocol_version == LOCAL_PROTOCOL_VERSION {
            VersionMatch::Match
        } else {
            VersionMatch::Mismatch
        };
        self.status.set_version_match(version_match);

        let channel = ConfigSyncChannel::bind(
            self.store.clone(),
            Arc::clone(&self.status),
            self.identity.mac_address.clone(),
            self.delta_feed.clone(),
        )
        .await?;
        self.sync_addr = Some(channel.local_addr()?);
        self.sync_handle = Some(tokio::spawn(channel.run()));

        self.start_metrics_server(config.metrics_port).await?;
        self.start_recorder_pipeline(&config)?;

        // Server-scoped state is refreshed once at startup and again on
        // every server address change.
        self.spawn_server_scope_refresh();

        self.running = true;
        info!("agent started");
        Ok(())
    }

    /// Stop the agent: tear down background tasks and wait for any
    /// in-flight capture job to finish its upload.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        info!("stopping agent");

        if let Some(handle) = self.metrics_server_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.sync_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.recorder_handle.take() {
            handle.abort();
        }

        self.scheduler.drain().await;

        self.running = false;
        info!("agent stopped");
        Ok(())
    }

    /// Run the main event loop until a shutdown signal arrives.
    #[instrument(skip(self))]
    pub async fn run_event_loop(&mut self) -> Result<()> {
        if !self.running {
            return Err(anyhow!("agent must be started before running the event loop"));
        }

        info!(
            period_ms = self.scheduler.period().as_millis() as u64,
            "entering control loop"
        );

        loop {
            tokio::select! {
                _ = self.scheduler.tick() => {
                    self.scheduler.run_tick();
                }

                delta = self.deltas.recv() => {
                    match delta {
                        Some(delta) => self.handle_config_delta(delta),
                        None => {
                            warn!("config delta feed closed");
                            break;
                        }
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        self.stop().await
    }

    /// React to a config change the sync channel has already applied.
    fn handle_config_delta(&mut self, delta: ConfigDelta) {
        let config = self.store.get();
        debug!(?delta, "applying config delta");
        self.counters.config_updates.inc();

        if delta.interval_changed {
            self.scheduler
                .reschedule(Duration::from_millis(config.capture_interval_ms));
        }
        if delta.server_changed {
            self.spawn_server_scope_refresh();
        }
        if delta.api_port_changed {
            // Upload targets snapshot the config per job, so nothing to
            // rewire here.
            debug!(port = config.api_port, "uploads now target a new api port");
        }
    }

    fn spawn_server_scope_refresh(&self) {
        let client = Arc::clone(&self.client);
        let store = self.store.clone();
        let hosts_path = self.hosts_path.clone();
        let device_id = self.identity.mac_address.clone();
        tokio::spawn(async move {
            refresh_server_scope(client, store, hosts_path, device_id).await;
        });
    }

    async fn start_metrics_server(&mut self, port: u16) -> Result<()> {
        let registry = self.metrics_registry.clone();
        let status = Arc::clone(&self.status);
        let store = self.store.clone();

        let app = Router::new()
            .route(
                "/metrics",
                get(move || async move {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
                        error!(error = %err, "failed to encode metrics");
                    }
                    String::from_utf8(buffer).unwrap_or_default()
                }),
            )
            .route("/health", get(|| async { "ok" }))
            .route(
                "/status",
                get(move || async move {
                    let config = store.get();
                    Json(json!({
                        "indicator": status.indicator().as_str(),
                        "registered": status.registration() == Registration::Registered,
                        "version_match": status.version_match() == VersionMatch::Match,
                        "server_address": config.server_address,
                        "capture_interval_ms": config.capture_interval_ms,
                    }))
                }),
            )
            .layer(CorsLayer::permissive());

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics server on {}", addr))?;
        let local = listener.local_addr()?;
        self.metrics_addr = Some(local);
        info!(addr = %local, "metrics server listening");

        self.metrics_server_handle = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "metrics server failed");
            }
        }));
        Ok(())
    }

    fn start_recorder_pipeline(&mut self, config: &AgentConfig) -> Result<()> {
        if !config.recorder.enabled {
            debug!("recorder disabled, skipping microphone monitor");
            return Ok(());
        }

        let recorder = AudioRecorder::from_settings(&config.recorder)?;
        let (events_tx, events_rx) = mpsc::channel(16);

        let settings = config.recorder.clone();
        self.monitor_handle = Some(tokio::spawn(async move {
            if let Err(err) = run_mic_monitor(settings, events_tx).await {
                warn!(error = %err, "microphone monitor exited");
            }
        }));
        self.recorder_handle = Some(tokio::spawn(recorder_supervisor(
            events_rx,
            recorder,
            Arc::clone(&self.approvals),
            Arc::clone(&self.client),
            self.store.clone(),
            self.identity.mac_address.clone(),
            self.counters.clone(),
        )));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn store(&self) -> ConfigStore {
        self.store.clone()
    }

    pub fn status(&self) -> Arc<AgentStatus> {
        Arc::clone(&self.status)
    }

    pub fn counters(&self) -> AgentCounters {
        self.counters.clone()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Address of the UDP config sync socket, once started.
    pub fn sync_addr(&self) -> Option<SocketAddr> {
        self.sync_addr
    }

    /// Address of the metrics/status HTTP listener, once started.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }
}

/// Refresh state scoped to the controller address: the hosts blocklist and
/// the peer gateway inventory. Failures are logged and swallowed.
async fn refresh_server_scope(
    client: Arc<ControllerClient>,
    store: ConfigStore,
    hosts_path: PathBuf,
    device_id: String,
) {
    let target = UploadTarget::from_config(&store.get());

    match client.fetch_blocklist(&target).await {
        Ok(blocklist) => match hosts::apply_blocklist(&hosts_path, &blocklist) {
            Ok(true) => info!(version = blocklist.version, "hosts blocklist updated"),
            Ok(false) => debug!(version = blocklist.version, "hosts blocklist already current"),
            Err(err) => warn!(error = %err, "failed to apply blocklist"),
        },
        Err(err) => warn!(error = %err, "failed to fetch blocklist"),
    }

    match client.fetch_peer_gateways(&target, &device_id).await {
        Ok(peers) => info!(count = peers.len(), "refreshed peer gateways"),
        Err(err) => warn!(error = %err, "failed to fetch peer gateways"),
    }
}

/// Drive the recorder from microphone transitions. An engage starts the
/// recorder only after the controller approves; a release stops it and
/// uploads the result.
async fn recorder_supervisor(
    mut events: mpsc::Receiver<MicTransition>,
    mut recorder: AudioRecorder,
    approvals: Arc<ApprovalCoordinator>,
    client: Arc<ControllerClient>,
    store: ConfigStore,
    device_id: String,
    counters: AgentCounters,
) {
    while let Some(transition) = events.recv().await {
        match transition {
            MicTransition::Engaged => {
                if recorder.is_recording() {
                    continue;
                }
                if !approvals.request_approval(&device_id).await {
                    counters.approvals_denied.inc();
                    info!("recording request was not approved");
                    continue;
                }
                counters.approvals_granted.inc();
                if let Err(err) = recorder.start() {
                    warn!(error = %err, "failed to start recorder");
                }
            }
            MicTransition::Released => match recorder.stop().await {
                Ok(Some(recording)) => {
                    let target = UploadTarget::from_config(&store.get());
                    if let Err(err) = client
                        .upload_recording(&target, &recording.path, recording.duration, &device_id)
                        .await
                    {
                        warn!(error = %err, "failed to upload recording");
                    } else if let Err(err) = tokio::fs::remove_file(&recording.path).await {
                        warn!(error = %err, "failed to remove uploaded recording");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to stop recorder"),
            },
        }
    }
}
