//! Error types for the s3-tar library.
//!
//! Every fallible public operation returns a [`Result<T>`], an alias for
//! `Result<T, Error>`.
//!
//! # Error Categories
//!
//! - **Registration-time** (raised before any network activity):
//!   [`Configuration`], [`InvalidSize`], [`DuplicateMember`]
//! - **Encoding**: [`Encoding`]
//! - **Run-time**: [`Transport`], [`IncompleteArchive`], [`Fetcher`]
//!
//! [`Configuration`]: Error::Configuration
//! [`InvalidSize`]: Error::InvalidSize
//! [`DuplicateMember`]: Error::DuplicateMember
//! [`Encoding`]: Error::Encoding
//! [`Transport`]: Error::Transport
//! [`IncompleteArchive`]: Error::IncompleteArchive
//! [`Fetcher`]: Error::Fetcher

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for archive operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The archive configuration is not usable.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A human-readable size string could not be parsed.
    #[error("value {0:?} is not a valid size")]
    InvalidSize(String),

    /// Two different source keys map to the same path inside the archive.
    #[error("filename '{member}' for key '{key}' already exists in the tar file (from '{existing}'); set allow_dups to continue")]
    DuplicateMember {
        member: String,
        existing: String,
        key: String,
    },

    /// A tar entry could not be built for the given member name.
    #[error("failed to encode tar entry {name:?}: {source}")]
    Encoding {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The object store rejected or failed a request.
    #[error("{op} {key} failed: {source:#}")]
    Transport {
        op: &'static str,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The archive was written, but some sources could not be fetched and are missing from it.
    #[error("{} source object(s) could not be fetched and are missing from the archive: {}", .failed.len(), .failed.join(", "))]
    IncompleteArchive { failed: Vec<String> },

    /// The background fetch task stopped unexpectedly.
    #[error("fetch task failed: {0}")]
    Fetcher(String),
}

impl Error {
    pub(crate) fn transport(op: &'static str, key: impl Into<String>, source: anyhow::Error) -> Self {
        Error::Transport {
            op,
            key: key.into(),
            source,
        }
    }
}
