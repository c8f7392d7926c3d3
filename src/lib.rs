//! Stream objects from an S3 bucket into tar archives written back to S3.
//!
//! Sources are fetched concurrently, each one is wrapped into its own tar fragment, and the
//! fragments are packed into multipart-upload parts as they arrive.  At no point does the whole
//! archive exist in memory or on local disk: memory use is bounded by the fetch cache and the
//! part size.
//!
//! Key functionality includes:
//! - Plain, gzip and bzip2 compressed output, chosen by the target key's extension
//! - Splitting the output into several numbered archives of a minimum size
//! - Optional JSON sidecars holding each object's user metadata
//! - Optional removal of the source objects after a successful run
//!
//! ```no_run
//! # async fn example() -> s3_tar::Result<()> {
//! use std::sync::Arc;
//! use s3_tar::{config::ArchiveConfig, planner::ArchivePlanner, store::s3::S3Store};
//!
//! let config = ArchiveConfig::new("my-bucket", "backups/logs.tar.gz");
//! let store = Arc::new(S3Store::connect(2 * config.cache_size, config.max_retries).await);
//! let mut planner = ArchivePlanner::new(store, config)?;
//! planner.add_files("logs/2024/", "", false).await?;
//! planner.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod mpu;
pub mod planner;
pub mod pool;
pub mod size;
pub mod store;

pub use error::{Error, Result};

/// Every part of a multipart upload except the last one must be at least this large.
pub const MIN_PART_SIZE: u64 = 5 * size::MB;
