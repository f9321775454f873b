//! # Edgeplane
//!
//! Edgeplane is an Envoy control plane for Kubernetes ingress. It reads
//! Ingress, HTTPProxy and Gateway API objects, builds a routing graph from
//! them and serves the result to Envoy over xDS.
//!
//! ## Architecture
//!
//! ```text
//! Kubernetes events → Resource Cache → Graph Builder → xDS Translators → Snapshot Caches → Envoy
//!        ↓                                   ↓
//!  Endpoints fast path                Status Writer
//! ```
//!
//! ## Core Components
//!
//! - **Resource Cache**: latest copy of every relevant Kubernetes object
//! - **Graph Builder**: processors that turn the cache into a validated DAG
//! - **Rebuild Coordinator**: debounced single writer for rebuilds
//! - **xDS Server**: Tonic gRPC server for ADS, CDS, EDS, LDS, RDS and SDS
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use edgeplane::cli;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     cli::run_cli().await
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod errors;
pub mod k8s;
pub mod observability;
pub mod utils;
pub mod xds;

pub use config::AppConfig;
pub use errors::{EdgeplaneError, Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
