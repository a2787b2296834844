//! Zipcode Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Pieces shared by the zipcode data-package tools:
//!
//! - **Checksums**: streaming SHA-256 over files of any size
//! - **Manifest**: the `digest.json` document published with each package
//! - **Logging**: `tracing` subscriber setup
//! - **Error Handling**: `CommonError` and its result alias
//!
//! # Example
//!
//! ```no_run
//! use zipcode_common::checksum::sha256_file;
//!
//! fn main() -> zipcode_common::Result<()> {
//!     let digest = sha256_file("build/data/ken_all_oogaki.csv")?;
//!     println!("{} ({} bytes)", digest.hex, digest.size_bytes);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod manifest;

pub use error::{CommonError, Result};
