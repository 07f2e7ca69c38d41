//! Outpost - device agent for remote capture, configuration sync, and
//! approval-gated audio recording.
//!
//! The crate pairs a UDP configuration channel with a periodic
//! capture/upload pipeline. Remote config updates merge into a shared
//! snapshot store, reschedule the capture timer, and drive a tray-style
//! health indicator; agent health is also exposed over HTTP.

pub mod agent;
pub mod approval;
pub mod capture;
pub mod config;
pub mod controller;
pub mod hosts;
pub mod identity;
pub mod recorder;
pub mod scheduler;
pub mod status;
pub mod sync;
