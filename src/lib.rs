//! # NetBackup Exporter
//!
//! A Prometheus metrics exporter for NetBackup primary servers.
//!
//! ## Overview
//!
//! Each scrape runs one collection cycle against the NetBackup REST API:
//!
//! - Storage unit capacity (free/used bytes per disk storage unit), cached
//!   for a configurable interval
//! - Jobs that ended within the scrape window, aggregated by action, policy
//!   type and exit status while paging through the jobs endpoint
//! - The API version in use, negotiated with the server unless configured
//!
//! A failure of one source is reported through `nbu_up` and
//! `nbu_collector_success` but never hides the other source's samples.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nbu_exporter::{
//!     client::ApiClient,
//!     config::Settings,
//!     metrics::{CollectorOptions, MetricsCollector},
//!     server::start_server,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load configuration
//!     let settings = Settings::load(Some("config/default.toml"))?;
//!
//!     // Create NetBackup client
//!     let options = CollectorOptions::from_config(&settings.nbu);
//!     let client = Arc::new(ApiClient::new(settings.nbu)?);
//!
//!     let metrics = Arc::new(MetricsCollector::new(client, options)?);
//!
//!     // Start HTTP server
//!     start_server(&settings.exporter.listen_address, metrics, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The exporter can be configured via:
//! - TOML configuration file
//! - Environment variables (e.g. `NBU_EXPORTER__NBU__HOST`)
//! - Command-line arguments
//!
//! See [`config::Settings`] for details.
//!
//! ## Modules
//!
//! - [`client`] - NetBackup API transport and wire types
//! - [`version`] - API version negotiation
//! - [`pagination`] - Job pagination and aggregation
//! - [`cache`] - TTL cache for the storage snapshot
//! - [`storage`] - Storage unit snapshot
//! - [`retry`] - Retry policy
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling
//! - [`metrics`] - Prometheus metrics definitions and collection
//! - [`server`] - HTTP server for exposing metrics

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pagination;
pub mod retry;
pub mod server;
pub mod storage;
pub mod version;

pub use error::{NbuError, Result};
