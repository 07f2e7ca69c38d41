//! Microphone monitor and audio recorder.
//!
//! The monitor runs an external probe process (ffmpeg with an astats filter,
//! typically) and scans its stderr for RMS level lines. Levels above the
//! configured floor while a conferencing app is running count as microphone
//! use; a run of quiet samples longer than the silence window counts as the
//! microphone going idle. Transitions between the two are debounced by
//! [`SilenceGate`] and forwarded over a channel so the agent can gate the
//! recorder behind an approval exchange.
//!
//! The recorder itself is another external command writing to a temp file.
//! `stop` interrupts it, waits for the file to be finalized and hands back
//! the path and wall-clock duration for upload.

use crate::config::RecorderSettings;
use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Process names (substring, lowercased) that count as a conferencing app.
pub const CONFERENCING_APPS: &[&str] =
    &["zoom", "chrome", "firefox", "slack", "teams", "discord"];

/// How long a stopped recorder gets to finalize its file before a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

static RMS_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"RMS level dB:\s*(-?\d+(\.\d+)?)").expect("RMS pattern compiles"));

/// Pull the RMS level out of a probe output line, e.g.
/// `[Parsed_astats_0 @ 0x...] Channel: 0 RMS level dB: -43.7`.
pub fn parse_rms_level(line: &str) -> Option<f32> {
    let caps = RMS_LEVEL.captures(line)?;
    caps.get(1)?.as_str().parse().ok()
}

/// One-shot scan of the process table for a conferencing app.
pub fn conferencing_app_running() -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All);
    system.processes().values().any(|process| {
        let name = process.name().to_string_lossy().to_lowercase();
        CONFERENCING_APPS.iter().any(|app| name.contains(app))
    })
}

/// Process-table probe with a short cache, so a chatty level feed does not
/// turn into a process scan per line.
pub struct AppProbe {
    system: System,
    checked_at: Option<Instant>,
    cached: bool,
    ttl: Duration,
}

impl AppProbe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            system: System::new(),
            checked_at: None,
            cached: false,
            ttl,
        }
    }

    pub fn running(&mut self) -> bool {
        let stale = match self.checked_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };
        if stale {
            self.system.refresh_processes(ProcessesToUpdate::All);
            self.cached = self.system.processes().values().any(|process| {
                let name = process.name().to_string_lossy().to_lowercase();
                CONFERENCING_APPS.iter().any(|app| name.contains(app))
            });
            self.checked_at = Some(Instant::now());
        }
        self.cached
    }
}

impl Default for AppProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Debounced microphone state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicTransition {
    /// The microphone went from idle to in use.
    Engaged,
    /// The microphone went quiet for a full silence window.
    Released,
}

/// Debounces raw level samples into engage/release transitions.
///
/// A sample counts as loud when the level clears the floor while a
/// conferencing app is running. Quiet samples accumulate; only a run longer
/// than the window releases the gate, and any loud sample resets the run.
pub struct SilenceGate {
    threshold_db: f32,
    window: u32,
    quiet_samples: u32,
    engaged: bool,
}

impl SilenceGate {
    pub fn new(threshold_db: f32, window: u32) -> Self {
        Self {
            threshold_db,
            window,
            quiet_samples: 0,
            engaged: false,
        }
    }

    pub fn from_settings(settings: &RecorderSettings) -> Self {
        Self::new(settings.level_threshold_db, settings.silence_window)
    }

    pub fn engaged(&self) -> bool {
        self.engaged
    }

    pub fn observe(&mut self, level_db: f32, app_running: bool) -> Option<MicTransition> {
        if level_db > self.threshold_db && app_running {
            self.quiet_samples = 0;
            if !self.engaged {
                self.engaged = true;
                return Some(MicTransition::Engaged);
            }
            None
        } else {
            self.quiet_samples = self.quiet_samples.saturating_add(1);
            if self.quiet_samples > self.window && self.engaged {
                self.engaged = false;
                return Some(MicTransition::Released);
            }
            None
        }
    }
}

/// A finished recording ready for upload.
#[derive(Debug)]
pub struct Recording {
    pub path: PathBuf,
    pub duration: Duration,
}

struct RecordingSession {
    child: Child,
    path: PathBuf,
    started: Instant,
}

/// External-process audio recorder.
pub struct AudioRecorder {
    command: String,
    session: Option<RecordingSession>,
}

impl AudioRecorder {
    pub fn new(command: String) -> Self {
        Self {
            command,
            session: None,
        }
    }

    pub fn from_settings(settings: &RecorderSettings) -> Result<Self> {
        let command = settings
            .command
            .clone()
            .context("recorder enabled but no recorder command configured")?;
        Ok(Self::new(command))
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Launch the recorder process. A second start while one is running is
    /// a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.session.is_some() {
            debug!("recorder already running, ignoring start");
            return Ok(());
        }

        let output = std::env::temp_dir().join(format!(
            "outpost-recording-{}.mov",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        let rendered = self.command.replace("{output}", &output.to_string_lossy());
        let parts = shlex::split(&rendered)
            .with_context(|| format!("recorder command failed to parse: {rendered}"))?;
        let (program, args) = parts
            .split_first()
            .context("recorder command is empty")?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch recorder: {program}"))?;

        info!(output = %output.display(), "recording started");
        self.session = Some(RecordingSession {
            child,
            path: output,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Stop the recorder and hand back the finished recording. Returns
    /// `Ok(None)` when nothing was running.
    pub async fn stop(&mut self) -> Result<Option<Recording>> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };
        let RecordingSession {
            mut child,
            path,
            started,
        } = session;
        let duration = started.elapsed();

        // An interrupt lets the recorder finalize the file; a kill is the
        // fallback when it does not exit in time.
        if !request_interrupt(&child).await
            || timeout(STOP_GRACE, child.wait()).await.is_err()
        {
            child.start_kill().context("failed to stop recorder process")?;
        }
        let _ = timeout(STOP_GRACE, child.wait()).await;

        info!(
            path = %path.display(),
            duration_secs = duration.as_secs(),
            "recording stopped"
        );
        Ok(Some(Recording { path, duration }))
    }
}

#[cfg(unix)]
async fn request_interrupt(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn request_interrupt(_child: &Child) -> bool {
    false
}

/// Run the microphone level probe and forward debounced transitions on
/// `events`. Returns when the probe exits or the receiver is dropped.
pub async fn run_mic_monitor(
    settings: RecorderSettings,
    events: mpsc::Sender<MicTransition>,
) -> Result<()> {
    let mut probe = AppProbe::default();
    monitor_with(settings, events, move || probe.running()).await
}

async fn monitor_with(
    settings: RecorderSettings,
    events: mpsc::Sender<MicTransition>,
    mut app_running: impl FnMut() -> bool,
) -> Result<()> {
    let command = settings
        .monitor_command
        .clone()
        .context("microphone monitor enabled but no monitor command configured")?;
    let parts = shlex::split(&command)
        .with_context(|| format!("monitor command failed to parse: {command}"))?;
    let (program, args) = parts
        .split_first()
        .context("monitor command is empty")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to launch microphone monitor: {program}"))?;

    let stderr = child
        .stderr
        .take()
        .context("monitor process has no stderr handle")?;
    let mut lines = BufReader::new(stderr).lines();
    let mut gate = SilenceGate::from_settings(&settings);

    info!(command = %command, "microphone monitor started");
    while let Some(line) = lines.next_line().await? {
        let Some(level) = parse_rms_level(&line) else {
            continue;
        };
        if let Some(transition) = gate.observe(level, app_running()) {
            debug!(?transition, level, "microphone transition");
            if events.send(transition).await.is_err() {
                break;
            }
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        warn!(%status, "microphone monitor exited abnormally");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rms_level() {
        assert_eq!(
            parse_rms_level("[Parsed_astats_0 @ 0x7f8] Channel: 0 RMS level dB: -43.7"),
            Some(-43.7)
        );
        assert_eq!(parse_rms_level("RMS level dB: -50"), Some(-50.0));
        assert_eq!(parse_rms_level("RMS level dB:  12.5"), Some(12.5));
        assert_eq!(parse_rms_level("Peak level dB: -3.0"), None);
        assert_eq!(parse_rms_level(""), None);
    }

    #[test]
    fn test_gate_engages_on_loud_sample_with_app() {
        let mut gate = SilenceGate::new(-50.0, 5);
        assert_eq!(gate.observe(-43.0, true), Some(MicTransition::Engaged));
        assert!(gate.engaged());
        // Staying loud produces no further transitions.
        assert_eq!(gate.observe(-40.0, true), None);
    }

    #[test]
    fn test_gate_ignores_loud_samples_without_app() {
        let mut gate = SilenceGate::new(-50.0, 5);
        assert_eq!(gate.observe(-10.0, false), None);
        assert!(!gate.engaged());
    }

    #[test]
    fn test_gate_releases_after_full_silence_window() {
        let mut gate = SilenceGate::new(-50.0, 5);
        gate.observe(-40.0, true);

        // Five quiet samples are inside the window.
        for _ in 0..5 {
            assert_eq!(gate.observe(-60.0, true), None);
        }
        // The sixth crosses it.
        assert_eq!(gate.observe(-60.0, true), Some(MicTransition::Released));
        assert!(!gate.engaged());
    }

    #[test]
    fn test_gate_silence_run_resets_on_loud_sample() {
        let mut gate = SilenceGate::new(-50.0, 3);
        gate.observe(-40.0, true);

        gate.observe(-60.0, true);
        gate.observe(-60.0, true);
        gate.observe(-40.0, true);
        // The earlier quiet run no longer counts.
        gate.observe(-60.0, true);
        gate.observe(-60.0, true);
        assert_eq!(gate.observe(-60.0, true), None);
        assert_eq!(gate.observe(-60.0, true), Some(MicTransition::Released));
    }

    #[test]
    fn test_gate_app_exit_counts_as_silence() {
        let mut gate = SilenceGate::new(-50.0, 2);
        gate.observe(-40.0, true);

        // Loud samples without the app behave like quiet ones.
        assert_eq!(gate.observe(-40.0, false), None);
        assert_eq!(gate.observe(-40.0, false), None);
        assert_eq!(gate.observe(-40.0, false), Some(MicTransition::Released));
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut gate = SilenceGate::new(-50.0, 5);
        // Exactly the floor does not engage.
        assert_eq!(gate.observe(-50.0, true), None);
        assert_eq!(gate.observe(-49.9, true), Some(MicTransition::Engaged));
    }

    #[tokio::test]
    async fn test_recorder_start_stop_reports_duration() {
        let mut recorder = AudioRecorder::new("sleep 30".to_string());
        recorder.start().unwrap();
        assert!(recorder.is_recording());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let recording = recorder.stop().await.unwrap().unwrap();
        assert!(!recorder.is_recording());
        assert!(recording.duration >= Duration::from_millis(100));
        assert!(recording.duration < Duration::from_secs(10));
        assert!(recording
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("outpost-recording-"));
    }

    #[tokio::test]
    async fn test_recorder_stop_without_start_is_none() {
        let mut recorder = AudioRecorder::new("sleep 30".to_string());
        assert!(recorder.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recorder_double_start_is_single_session() {
        let mut recorder = AudioRecorder::new("sleep 30".to_string());
        recorder.start().unwrap();
        let first_path = recorder.session.as_ref().map(|s| s.path.clone());
        recorder.start().unwrap();
        assert_eq!(
            recorder.session.as_ref().map(|s| s.path.clone()),
            first_path
        );
        recorder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recorder_rejects_unparseable_command() {
        let mut recorder = AudioRecorder::new("sleep 'unterminated".to_string());
        assert!(recorder.start().is_err());
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_monitor_forwards_transitions_from_probe_output() {
        // A fake probe emitting a loud sample, noise, then a quiet run on
        // stderr, like ffmpeg's astats output would.
        let script = "printf 'RMS level dB: -30.0\\n\
                      not a level line\\n\
                      RMS level dB: -60.0\\n\
                      RMS level dB: -60.0\\n\
                      RMS level dB: -60.0\\n' 1>&2";
        let settings = RecorderSettings {
            enabled: true,
            monitor_command: Some(format!("sh -c \"{script}\"")),
            silence_window: 2,
            level_threshold_db: -50.0,
            ..RecorderSettings::default()
        };

        let (tx, mut rx) = mpsc::channel(8);
        monitor_with(settings, tx, || true).await.unwrap();

        let mut transitions = Vec::new();
        while let Ok(transition) = rx.try_recv() {
            transitions.push(transition);
        }
        assert_eq!(
            transitions,
            vec![MicTransition::Engaged, MicTransition::Released]
        );
    }

    #[tokio::test]
    async fn test_monitor_requires_command() {
        let (tx, _rx) = mpsc::channel(4);
        let settings = RecorderSettings {
            enabled: true,
            ..RecorderSettings::default()
        };
        assert!(run_mic_monitor(settings, tx).await.is_err());
    }
}
