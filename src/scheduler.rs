//! Capture/upload scheduler.
//!
//! Drives the periodic pipeline. Each tick spawns one job that captures,
//! transcodes, assembles and uploads; the job carries a one-permit semaphore
//! so a tick that fires while the previous job is still running is dropped,
//! never queued. Rescheduling replaces the timer only when the period
//! actually changes; the next tick then lands one full new period after the
//! reschedule. Job failures color the status, bump a counter and are
//! otherwise swallowed.

use crate::agent::AgentCounters;
use crate::capture::{CaptureProvider, ImageTranscoder};
use crate::config::ConfigStore;
use crate::controller::{encode_payload, UploadMetadata, UploadSink, UploadTarget};
use crate::identity::{system_active, DeviceIdentity};
use crate::status::{AgentStatus, Registration};
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a capture job needs, bundled so one `Arc` rides into the
/// spawned task.
struct PipelineContext {
    provider: Arc<dyn CaptureProvider>,
    transcoder: Arc<dyn ImageTranscoder>,
    sink: Arc<dyn UploadSink>,
    store: ConfigStore,
    status: Arc<AgentStatus>,
    identity: DeviceIdentity,
    counters: AgentCounters,
}

pub struct CaptureUploadScheduler {
    interval: Interval,
    period: Duration,
    inflight: Arc<Semaphore>,
    context: Arc<PipelineContext>,
    jobs: Vec<JoinHandle<()>>,
}

impl CaptureUploadScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        period: Duration,
        provider: Arc<dyn CaptureProvider>,
        transcoder: Arc<dyn ImageTranscoder>,
        sink: Arc<dyn UploadSink>,
        store: ConfigStore,
        status: Arc<AgentStatus>,
        identity: DeviceIdentity,
        counters: AgentCounters,
    ) -> Self {
        Self {
            interval: new_interval(period),
            period,
            inflight: Arc::new(Semaphore::new(1)),
            context: Arc::new(PipelineContext {
                provider,
                transcoder,
                sink,
                store,
                status,
                identity,
                counters,
            }),
            jobs: Vec::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next timer tick.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Handle one tick: start a capture job unless one is still in flight.
    pub fn run_tick(&mut self) {
        self.jobs.retain(|job| !job.is_finished());

        let permit = match Arc::clone(&self.inflight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("previous capture job still in flight, dropping tick");
                self.context.counters.skipped_ticks.inc();
                return;
            }
        };

        let context = Arc::clone(&self.context);
        self.jobs.push(tokio::spawn(run_capture_job(context, permit)));
    }

    /// Point the timer at a new period. An equal period is a no-op and
    /// preserves the current phase; a different one restarts the timer with
    /// the next tick one full new period from now.
    pub fn reschedule(&mut self, period: Duration) {
        if period == self.period {
            return;
        }
        info!(
            from_ms = self.period.as_millis() as u64,
            to_ms = period.as_millis() as u64,
            "rescheduling capture timer"
        );
        self.period = period;
        self.interval = new_interval(period);
    }

    /// Wait for in-flight jobs to finish. Used on shutdown.
    pub async fn drain(&mut self) {
        let jobs = std::mem::take(&mut self.jobs);
        join_all(jobs).await;
    }
}

fn new_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    // Late ticks are dropped, not replayed in a burst.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// One capture job. Never fails upward: the outcome lands in the status
/// color, the counters and the log. The permit is held for the whole
/// pipeline, including the upload.
async fn run_capture_job(context: Arc<PipelineContext>, permit: OwnedSemaphorePermit) {
    let job_id = Uuid::new_v4();
    let started = Instant::now();

    let success = execute_pipeline(&context, job_id).await;

    context.status.record_outcome(success);
    if success {
        context.counters.captures.inc();
    } else {
        context.counters.upload_failures.inc();
    }
    debug!(
        %job_id,
        success,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "capture job finished"
    );
    drop(permit);
}

async fn execute_pipeline(context: &PipelineContext, job_id: Uuid) -> bool {
    let frames = match context.provider.capture().await {
        Ok(frames) => frames,
        Err(err) => {
            warn!(%job_id, error = %err, "capture failed");
            return false;
        }
    };
    if frames.is_empty() {
        debug!(%job_id, "nothing captured this cycle");
        return true;
    }

    // Snapshot the config once so a mid-job change cannot split the target.
    let config = context.store.get();
    let target = UploadTarget::from_config(&config);
    let metadata = UploadMetadata {
        device_id: context.identity.mac_address.clone(),
        user_id: config.user_id.clone().unwrap_or_default(),
        username: context.identity.username.clone(),
        local_ip: context.identity.local_ip.clone(),
        active: system_active(config.capture.activity_cpu_threshold),
        registered: context.status.registration() == Registration::Registered,
        captured_at: Utc::now().to_rfc3339(),
    };

    let payload = match encode_payload(&frames, context.transcoder.as_ref(), metadata) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%job_id, error = %err, "transcode failed");
            return false;
        }
    };

    match context.sink.upload(&target, &payload).await {
        Ok(()) => true,
        Err(err) => {
            warn!(%job_id, error = %err, url = %target.upload_url(), "upload failed");
            false
        }
    }
}
