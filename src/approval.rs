//! UDP approval handshake with the controller.
//!
//! Sensitive actions (starting an audio recording) ask the controller for
//! permission first. A request is one datagram; the resolution is the first
//! correlated response, the deadline, or a send failure, whichever comes
//! first, and every failure path resolves to a denial. One request may be
//! outstanding at a time; a second caller is denied immediately rather than
//! queued.

use crate::config::ConfigStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Default deadline for an approval response. Config can override it via
/// `approval_timeout_secs`.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(20);

const MAX_DATAGRAM: usize = 8 * 1024;

/// Lifecycle of the approval slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    Idle,
    AwaitingResponse,
    Approved,
    Denied,
    TimedOut,
}

pub struct ApprovalCoordinator {
    store: ConfigStore,
    timeout_override: Option<Duration>,
    /// Single request slot; try-locked, never awaited, so an occupied slot
    /// rejects instead of queueing.
    slot: tokio::sync::Mutex<()>,
    awaiting: AtomicBool,
    last_outcome: Mutex<Option<ApprovalState>>,
}

impl ApprovalCoordinator {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            timeout_override: None,
            slot: tokio::sync::Mutex::new(()),
            awaiting: AtomicBool::new(false),
            last_outcome: Mutex::new(None),
        }
    }

    /// Replace the config-derived deadline. Tests shorten it.
    pub fn with_timeout(mut self, deadline: Duration) -> Self {
        self.timeout_override = Some(deadline);
        self
    }

    /// Idle, or awaiting a response. Terminal outcomes are reported by
    /// [`ApprovalCoordinator::last_outcome`]; the slot itself frees as soon
    /// as a request resolves.
    pub fn state(&self) -> ApprovalState {
        if self.awaiting.load(Ordering::SeqCst) {
            ApprovalState::AwaitingResponse
        } else {
            ApprovalState::Idle
        }
    }

    /// How the most recent request resolved.
    pub fn last_outcome(&self) -> Option<ApprovalState> {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the controller to approve a sensitive action for this device.
    ///
    /// Resolves `true` only on a correlated response carrying
    /// `approved: true` within the deadline. Timeouts, send failures,
    /// responses without a boolean `true`, and an already-occupied slot all
    /// resolve `false`.
    pub async fn request_approval(&self, device_id: &str) -> bool {
        let _slot = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(device_id, "approval request already outstanding, denying");
                return false;
            }
        };
        self.awaiting.store(true, Ordering::SeqCst);

        let config = self.store.get();
        let deadline = self
            .timeout_override
            .unwrap_or_else(|| Duration::from_secs(config.approval_timeout_secs));
        let target = format!("{}:{}", config.server_address, config.approval_port);

        let outcome = self.exchange(device_id, &target, deadline).await;
        info!(device_id, ?outcome, "approval request resolved");

        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.awaiting.store(false, Ordering::SeqCst);

        outcome == ApprovalState::Approved
    }

    /// Send one request from a fresh ephemeral socket and wait for the
    /// resolution. A fresh socket per exchange keeps stale responses from an
    /// earlier timed-out request out of this one.
    async fn exchange(&self, device_id: &str, target: &str, deadline: Duration) -> ApprovalState {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(error = %err, "approval socket bind failed");
                return ApprovalState::Denied;
            }
        };

        let request = json!({ "type": "approval-request", "mac": device_id });
        let bytes = match serde_json::to_vec(&request) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "approval request encode failed");
                return ApprovalState::Denied;
            }
        };

        if let Err(err) = socket.send_to(&bytes, target).await {
            warn!(error = %err, target, "approval request send failed, denying");
            return ApprovalState::Denied;
        }
        debug!(target, device_id, "approval request sent");

        let deadline_at = Instant::now() + deadline;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ApprovalState::TimedOut;
            }

            let received = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _peer))) => &buf[..len],
                Ok(Err(err)) => {
                    warn!(error = %err, "approval receive failed");
                    continue;
                }
                Err(_) => return ApprovalState::TimedOut,
            };

            match parse_response(received, device_id) {
                Some(true) => return ApprovalState::Approved,
                Some(false) => return ApprovalState::Denied,
                // Foreign or unparseable datagram; keep waiting.
                None => debug!("ignoring unrelated datagram on approval socket"),
            }
        }
    }
}

/// `Some(approved)` for a response correlated to this device, `None` for
/// anything else. A correlated response whose `approved` field is missing or
/// not boolean `true` is an explicit denial, not noise.
fn parse_response(bytes: &[u8], device_id: &str) -> Option<bool> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("approval-response") {
        return None;
    }
    if let Some(mac) = value.get("mac").and_then(Value::as_str) {
        if mac != device_id {
            return None;
        }
    }
    Some(value.get("approved").and_then(Value::as_bool) == Some(true))
}
