//! Agent health model and the tray-style indicator.
//!
//! Capture/upload outcomes set a transient color, the controller's
//! registration decision picks which color a success maps to, and a protocol
//! version mismatch overrides everything with a flashing presentation until
//! the versions agree again. Consumers watch the published color feed; the
//! agent's status endpoint reports the derived indicator.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Alternation period of the version-mismatch flasher.
pub const FLASH_PERIOD: Duration = Duration::from_millis(500);

/// Whether the controller currently considers this device managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Unregistered,
}

/// Agreement between the controller-announced protocol version and the
/// local build version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMatch {
    Match,
    Mismatch,
}

/// Colors published on the indicator feed. Gray until the first outcome,
/// blue for healthy, red for degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayColor {
    Gray,
    Blue,
    Red,
}

/// Externally visible indicator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Idle,
    Healthy,
    Degraded,
    Flashing,
}

impl Indicator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Indicator::Idle => "idle",
            Indicator::Healthy => "healthy",
            Indicator::Degraded => "degraded",
            Indicator::Flashing => "flashing",
        }
    }
}

struct StatusState {
    registration: Registration,
    version_match: VersionMatch,
    last_color: TrayColor,
}

/// Shared agent health state. Cheap to share behind an `Arc`; all methods
/// take `&self`.
pub struct AgentStatus {
    state: RwLock<StatusState>,
    colors: Arc<watch::Sender<TrayColor>>,
    // Held so publishing never observes a closed channel.
    _color_feed: watch::Receiver<TrayColor>,
    flasher: Mutex<Option<JoinHandle<()>>>,
    flash_period: Duration,
}

impl AgentStatus {
    pub fn new() -> Self {
        Self::with_flash_period(FLASH_PERIOD)
    }

    /// Like [`AgentStatus::new`] with a custom flash period. Tests shorten
    /// the period to keep runtimes down.
    pub fn with_flash_period(flash_period: Duration) -> Self {
        let (colors, color_feed) = watch::channel(TrayColor::Gray);
        Self {
            state: RwLock::new(StatusState {
                registration: Registration::Registered,
                version_match: VersionMatch::Match,
                last_color: TrayColor::Gray,
            }),
            colors: Arc::new(colors),
            _color_feed: color_feed,
            flasher: Mutex::new(None),
            flash_period,
        }
    }

    pub fn registration(&self) -> Registration {
        self.read().registration
    }

    pub fn version_match(&self) -> VersionMatch {
        self.read().version_match
    }

    pub fn last_color(&self) -> TrayColor {
        self.read().last_color
    }

    /// Derived indicator: flashing while versions disagree, otherwise the
    /// last transient color.
    pub fn indicator(&self) -> Indicator {
        let state = self.read();
        if state.version_match == VersionMatch::Mismatch {
            return Indicator::Flashing;
        }
        match state.last_color {
            TrayColor::Gray => Indicator::Idle,
            TrayColor::Blue => Indicator::Healthy,
            TrayColor::Red => Indicator::Degraded,
        }
    }

    /// Subscribe to the published color feed.
    pub fn subscribe(&self) -> watch::Receiver<TrayColor> {
        self.colors.subscribe()
    }

    pub fn set_registration(&self, registration: Registration) {
        let mut state = self.write();
        if state.registration != registration {
            debug!(?registration, "registration changed");
            state.registration = registration;
        }
    }

    /// Record the outcome of one capture/upload cycle. Success shows the
    /// healthy color only while registered; any failure shows the degraded
    /// color.
    pub fn record_outcome(&self, success: bool) {
        let color = {
            let mut state = self.write();
            let color = if success {
                match state.registration {
                    Registration::Registered => TrayColor::Blue,
                    Registration::Unregistered => TrayColor::Red,
                }
            } else {
                TrayColor::Red
            };
            state.last_color = color;
            color
        };
        // While flashing, the flasher owns the feed; the recorded color
        // still feeds the indicator once the mismatch clears.
        if !self.is_flashing() {
            self.colors.send_replace(color);
        }
    }

    /// Apply a version comparison, starting or stopping the flasher on the
    /// corresponding transitions. Redundant calls in either direction are
    /// no-ops.
    pub fn set_version_match(&self, version_match: VersionMatch) {
        self.write().version_match = version_match;
        match version_match {
            VersionMatch::Mismatch => self.start_flash(),
            VersionMatch::Match => self.stop_flash(),
        }
    }

    pub fn is_flashing(&self) -> bool {
        self.flasher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn start_flash(&self) {
        let mut flasher = self.flasher.lock().unwrap_or_else(PoisonError::into_inner);
        if flasher.is_some() {
            return;
        }
        debug!("starting version-mismatch flasher");
        let colors = Arc::clone(&self.colors);
        let period = self.flash_period;
        *flasher = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut alert = true;
            loop {
                interval.tick().await;
                colors.send_replace(if alert { TrayColor::Red } else { TrayColor::Blue });
                alert = !alert;
            }
        }));
    }

    fn stop_flash(&self) {
        let handle = self
            .flasher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            debug!("stopping version-mismatch flasher");
            handle.abort();
            // Revert to the steady healthy color.
            self.write().last_color = TrayColor::Blue;
            self.colors.send_replace(TrayColor::Blue);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StatusState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StatusState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AgentStatus {
    fn drop(&mut self) {
        if let Some(handle) = self
            .flasher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[test]
    fn test_initial_state() {
        let status = AgentStatus::new();
        assert_eq!(status.indicator(), Indicator::Idle);
        assert_eq!(status.last_color(), TrayColor::Gray);
        assert_eq!(status.registration(), Registration::Registered);
        assert_eq!(status.version_match(), VersionMatch::Match);
        assert!(!status.is_flashing());
    }

    #[tokio::test]
    async fn test_outcome_coloring_follows_registration() {
        let status = AgentStatus::new();

        status.record_outcome(true);
        assert_eq!(status.last_color(), TrayColor::Blue);
        assert_eq!(status.indicator(), Indicator::Healthy);

        status.set_registration(Registration::Unregistered);
        status.record_outcome(true);
        assert_eq!(status.last_color(), TrayColor::Red);
        assert_eq!(status.indicator(), Indicator::Degraded);

        status.set_registration(Registration::Registered);
        status.record_outcome(false);
        assert_eq!(status.last_color(), TrayColor::Red);
        assert_eq!(status.indicator(), Indicator::Degraded);
    }

    #[tokio::test]
    async fn test_mismatch_overrides_outcomes() {
        let status = AgentStatus::new();
        status.set_version_match(VersionMatch::Mismatch);
        status.record_outcome(true);
        assert_eq!(status.indicator(), Indicator::Flashing);

        status.set_version_match(VersionMatch::Match);
        assert_eq!(status.indicator(), Indicator::Healthy);
    }

    #[tokio::test]
    async fn test_flasher_alternates_colors() {
        let status = AgentStatus::with_flash_period(Duration::from_millis(20));
        let mut feed = status.subscribe();
        status.set_version_match(VersionMatch::Mismatch);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            timeout(Duration::from_secs(2), feed.changed())
                .await
                .expect("flasher stopped publishing")
                .unwrap();
            seen.push(*feed.borrow_and_update());
        }
        assert!(seen.contains(&TrayColor::Red));
        assert!(seen.contains(&TrayColor::Blue));
        for pair in seen.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_flash_start_is_idempotent() {
        let status = AgentStatus::with_flash_period(Duration::from_millis(25));
        status.set_version_match(VersionMatch::Mismatch);
        status.set_version_match(VersionMatch::Mismatch);
        assert!(status.is_flashing());

        // A second start must not add a second publisher; with one flasher
        // the feed changes roughly once per period.
        let mut feed = status.subscribe();
        feed.borrow_and_update();
        let mut changes = 0u32;
        let window = Duration::from_millis(250);
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, feed.changed()).await {
                Ok(Ok(())) => {
                    feed.borrow_and_update();
                    changes += 1;
                }
                _ => break,
            }
        }
        assert!(changes >= 4, "flasher too slow: {changes} changes");
        assert!(changes <= 16, "duplicate flasher suspected: {changes} changes");
    }

    #[tokio::test]
    async fn test_flash_stop_is_idempotent_and_reverts() {
        let status = AgentStatus::with_flash_period(Duration::from_millis(10));
        status.set_version_match(VersionMatch::Mismatch);
        assert!(status.is_flashing());
        sleep(Duration::from_millis(35)).await;

        status.set_version_match(VersionMatch::Match);
        assert!(!status.is_flashing());
        assert_eq!(status.last_color(), TrayColor::Blue);
        assert_eq!(*status.subscribe().borrow(), TrayColor::Blue);
        assert_eq!(status.indicator(), Indicator::Healthy);

        // Stopping again changes nothing.
        status.set_version_match(VersionMatch::Match);
        assert!(!status.is_flashing());
        assert_eq!(status.indicator(), Indicator::Healthy);
    }

    #[tokio::test]
    async fn test_match_without_prior_mismatch_publishes_nothing() {
        let status = AgentStatus::new();
        let mut feed = status.subscribe();
        status.set_version_match(VersionMatch::Match);
        assert!(!feed.has_changed().unwrap());
        assert_eq!(status.indicator(), Indicator::Idle);
    }
}
