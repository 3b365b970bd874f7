//! driftscan - security surface drift detection library
//!
//! Exposes the scan workflow coordinator, the differential analysis and
//! classification engine, the write-queue drain coordinator, and the
//! collaborator traits (collectors, monitors, store, exporter) they drive.

pub mod analysis;
pub mod cancel;
pub mod cli;
pub mod collectors;
pub mod constants;
pub mod drain;
pub mod error;
pub mod exit_codes;
pub mod export;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod observer;
pub mod output;
pub mod rules;
pub mod settings;
pub mod store;
pub mod workflow;

/// Version recorded in run metadata and export headers
pub const VERSION: &str = env!("DRIFTSCAN_VERSION");

/// Short commit hash of the build
pub const GIT_HASH: &str = env!("GIT_HASH");
