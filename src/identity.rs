//! Device identity collection.
//!
//! Identity is collected once at startup and rides along with every upload.
//! The controller keys registration and approval correlation off the MAC
//! address, so collection prefers wired interfaces and falls back to
//! placeholder values rather than failing.

use serde::Serialize;
use std::net::IpAddr;
use sysinfo::{NetworkData, Networks, System};

const ZERO_MAC: &str = "00:00:00:00:00:00";
const UNKNOWN: &str = "unknown";

/// Identifying facts about the device this agent runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// MAC address of the primary interface; the controller's device key.
    pub mac_address: String,
    pub hostname: String,
    pub username: String,
    pub local_ip: String,
}

impl DeviceIdentity {
    /// Collect identity from the running system. Never fails; missing
    /// pieces collapse to placeholders (`unknown`, `127.0.0.1`).
    pub fn collect() -> Self {
        let networks = Networks::new_with_refreshed_list();

        Self {
            mac_address: primary_mac(&networks).unwrap_or_else(|| UNKNOWN.to_string()),
            hostname: hostname::get()
                .ok()
                .and_then(|name| name.to_str().map(str::to_string))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            username: users::get_current_username()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            local_ip: primary_ipv4(&networks).unwrap_or_else(|| "127.0.0.1".to_string()),
        }
    }
}

fn is_wired(name: &str) -> bool {
    name.starts_with("eth") || name.starts_with("en")
}

/// Interfaces in deterministic order: wired first, then by name. Loopback
/// falls out naturally because its MAC is all zeroes and its addresses are
/// loopback.
fn ordered_interfaces(networks: &Networks) -> Vec<(&String, &NetworkData)> {
    let mut interfaces: Vec<_> = networks.list().iter().collect();
    interfaces.sort_by(|(a, _), (b, _)| {
        is_wired(b)
            .cmp(&is_wired(a))
            .then_with(|| a.as_str().cmp(b.as_str()))
    });
    interfaces
}

fn primary_mac(networks: &Networks) -> Option<String> {
    for (_name, data) in ordered_interfaces(networks) {
        let mac = data.mac_address().to_string();
        if !mac.is_empty() && mac != ZERO_MAC {
            return Some(mac);
        }
    }
    None
}

fn primary_ipv4(networks: &Networks) -> Option<String> {
    for (_name, data) in ordered_interfaces(networks) {
        for network in data.ip_networks() {
            if let IpAddr::V4(addr) = network.addr {
                if !addr.is_loopback() && !addr.is_link_local() {
                    return Some(addr.to_string());
                }
            }
        }
    }
    None
}

/// Whether the machine currently counts as in use, for upload metadata.
/// Activity is approximated by global CPU usage against the configured
/// threshold.
pub fn system_active(cpu_threshold: f32) -> bool {
    let mut system = System::new();
    system.refresh_cpu_all();
    system.global_cpu_usage() >= cpu_threshold
}
