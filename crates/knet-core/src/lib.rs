//! knet-core: Core library for knet
//!
//! This crate provides the core functionality for `kubectl knet`, a kubectl
//! plugin that attaches ephemeral diagnostic sidecars to running pods and
//! streams their output to the operator's workstation.
//!
//! # Architecture
//!
//! ```text
//! Targets → Session (inject → await ready → stream) → Sink
//!              ↓ per target                             ↓
//!         Coordinator  ─────────── all terminal ──→ Merge finalizer
//! ```
//!
//! # Modules
//!
//! - `gateway`: Cluster access seam (pods, ephemeral patches, exec, fleet objects)
//! - `kube_gateway`: `kube`-backed gateway
//! - `sidecar`: Ephemeral container descriptors and names
//! - `patch`: Merge patch generation for sidecar injection
//! - `poll`: Readiness polling (no fixed sleeps)
//! - `retry`: Backoff for patch conflicts
//! - `stream`: Remote command output pumping
//! - `target`: Target selection and resolution
//! - `sink`: Capture destinations (file, stdout, viewer)
//! - `session`: Per-target session lifecycle
//! - `coordinator`: Multi-target runs
//! - `merge`: Capture merge finalizer
//! - `fleet`: Node agent install, teardown and configuration
//! - `config`: Configuration management
//! - `logging`: Structured logging
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod kube_gateway;
pub mod logging;
pub mod merge;
pub mod patch;
pub mod poll;
pub mod retry;
pub mod session;
pub mod sidecar;
pub mod sink;
pub mod stream;
pub mod target;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
