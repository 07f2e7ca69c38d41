//! UDP configuration sync channel.
//!
//! The controller pushes configuration as JSON datagrams. Each datagram is a
//! partial snapshot: present fields replace, absent fields keep their current
//! values, and the merged result is swapped into the store in one step.
//! Registration and protocol-version transitions flow straight into
//! [`AgentStatus`]; a [`ConfigDelta`] is forwarded to the agent loop only
//! when a value actually changed, so change-driven side effects fire exactly
//! once per change and never on no-ops.

use crate::config::{merge_update, ConfigDelta, ConfigStore, ConfigUpdate, LOCAL_PROTOCOL_VERSION};
use crate::status::{AgentStatus, Registration, VersionMatch};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Largest accepted config datagram.
const MAX_DATAGRAM: usize = 64 * 1024;

pub struct ConfigSyncChannel {
    socket: UdpSocket,
    store: ConfigStore,
    status: Arc<AgentStatus>,
    device_id: String,
    local_version: String,
    deltas: mpsc::Sender<ConfigDelta>,
}

impl ConfigSyncChannel {
    /// Bind the listener on the store's control port. Port 0 binds an
    /// ephemeral port, discoverable through [`ConfigSyncChannel::local_addr`].
    pub async fn bind(
        store: ConfigStore,
        status: Arc<AgentStatus>,
        device_id: String,
        deltas: mpsc::Sender<ConfigDelta>,
    ) -> Result<Self> {
        let port = store.get().control_port;
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind config sync channel on port {}", port))?;
        info!(port = socket.local_addr()?.port(), "config sync channel listening");
        Ok(Self {
            socket,
            store,
            status,
            device_id,
            local_version: LOCAL_PROTOCOL_VERSION.to_string(),
            deltas,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("config sync channel has no local address")
    }

    /// Receive and apply datagrams until the agent loop goes away.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "config sync receive failed");
                    continue;
                }
            };

            if let Some(delta) = self.apply_bytes(&buf[..len]) {
                debug!(%peer, ?delta, "configuration changed");
                if self.deltas.send(delta).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Decode and apply one datagram. Returns a delta when an externally
    /// visible value changed; malformed input returns `None` and changes
    /// nothing.
    pub fn apply_bytes(&self, bytes: &[u8]) -> Option<ConfigDelta> {
        let update = match ConfigUpdate::decode(bytes) {
            Some(update) => update,
            None => {
                debug!(len = bytes.len(), "dropping malformed config datagram");
                return None;
            }
        };

        let current = self.store.get();
        let (merged, delta) = merge_update(&current, &update);

        // Every valid datagram is a complete registration snapshot.
        let registration = if update.frees_device(&self.device_id) {
            Registration::Unregistered
        } else {
            Registration::Registered
        };
        let version_match = if merged.protocol_version == self.local_version {
            VersionMatch::Match
        } else {
            VersionMatch::Mismatch
        };

        // Swap first so side effects observe the new snapshot.
        self.store.replace(merged);
        self.status.set_registration(registration);
        self.status.set_version_match(version_match);

        if delta.any() {
            Some(delta)
        } else {
            None
        }
    }
}
