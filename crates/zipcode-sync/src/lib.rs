//! Zipcode Sync Library
//!
//! Builds a data package of Japanese postal codes from the archives Japan
//! Post publishes: each archive is downloaded, its CSV payload extracted,
//! re-encoded to UTF-8 and NFKC-normalized, then the outputs are hashed into
//! a digest manifest, bundled and published.
//!
//! # Stages
//!
//! - [`fetch`]: idempotent archive download
//! - [`unpack`]: single-payload extraction
//! - [`normalize`]: encoding conversion and Unicode normalization
//! - [`sync`]: one resource through all of the above
//! - [`orchestrator`]: every resource concurrently, then manifest, package
//!   and publishing
//!
//! # Example
//!
//! ```no_run
//! use zipcode_sync::{Pipeline, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig::load()?;
//!     let summary = Pipeline::from_config(config).await?.run().await?;
//!     println!("{} resources synchronized", summary.succeeded());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod package;
pub mod sources;
pub mod storage;
pub mod sync;
pub mod unpack;

pub use catalog::{Catalog, ResourceDescriptor};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use orchestrator::{Pipeline, RunSummary};
pub use sync::{Stage, SyncResult};
