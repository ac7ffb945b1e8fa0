//! # Quakemesh - Seismic Telemetry Relay for Self-Organizing Meshes
//!
//! Quakemesh moves earthquake sensor readings from battery powered sensor
//! nodes across a wireless mesh to a cloud telemetry service, and pushes
//! firmware updates back down the same path.
//!
//! ## Features
//!
//! - **Three-tier relay**: sender nodes broadcast readings, a mesh gateway
//!   forwards them over a serial link, a WiFi gateway publishes them to the cloud.
//! - **Admission control**: earthquake alerts are always admitted; routine
//!   readings are dropped once the relay queue passes its congestion threshold.
//! - **Over-the-air updates**: chunked, acknowledged firmware transfer with
//!   per-chunk retry, SHA-256 verification and stall timeouts.
//! - **Node health**: heartbeat supervision on the mesh, presence sweep and
//!   per-node counters on the WiFi gateway.
//! - **Management API**: optional HTTP surface (feature `web`) for node lists,
//!   statistics and manual OTA control.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quakemesh::config::Config;
//! use quakemesh::simulate::{self, SimulationOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("quakemesh.toml").await?;
//!     let report = simulate::run(
//!         &config,
//!         SimulationOptions {
//!             senders: 3,
//!             firmware: std::fs::read("firmware.bin")?,
//!             version: "9.0.0".into(),
//!             timeout: Duration::from_secs(60),
//!         },
//!     )
//!     .await?;
//!     println!("all updated: {}", report.all_updated);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - JSON envelope catalogue and firmware version ordering
//! - [`transport`] - mesh and serial link capabilities plus adapters
//! - [`relay`] - bounded priority queue with admission control
//! - [`health`] - node registry, heartbeat supervision, presence sweep
//! - [`ota`] - distributor, relay and receiver state machines
//! - [`roles`] - one run loop per device role
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Sender Node   │ ← sensor reads, OTA receiver
//! └─────────────────┘
//!          │ mesh
//! ┌─────────────────┐
//! │  Mesh Gateway   │ ← admission control, heartbeats
//! └─────────────────┘
//!          │ serial (newline JSON)
//! ┌─────────────────┐
//! │  WiFi Gateway   │ ← cloud telemetry, OTA distributor
//! └─────────────────┘
//! ```

pub mod cloud;
pub mod config;
pub mod errors;
pub mod health;
pub mod logutil;
pub mod metrics;
pub mod ota;
pub mod protocol;
pub mod relay;
pub mod roles;
pub mod sensor;
pub mod simulate;
pub mod transport;
#[cfg(feature = "web")]
pub mod web;
