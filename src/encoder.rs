//! Encoding of individual tar entries.
//!
//! Every source object becomes one self-contained fragment: a ustar header, the payload, and
//! padding up to the next block boundary.  Fragments are appended to each other to form the
//! output archive, so the encoder never needs to see more than one object at a time.
//!
//! For compressed archives each fragment is a complete compression member of its own (a gzip
//! member or a bzip2 stream).  Concatenated members decode as a single stream, which lets the
//! fragments be produced concurrently and in any worker.  Only the fragment flagged
//! [`EntryPosition::Final`] carries the tar end-of-archive marker.

use std::io;

use async_compression::tokio::write::{BzEncoder, GzipEncoder};
use tar::{EntryType, Header};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

// Constants related to tar archives
pub const TAR_BLOCK_SIZE: usize = 512;
/// Two zero blocks mark the end of a tar archive.
pub const TAR_END_OF_ARCHIVE: [u8; 2 * TAR_BLOCK_SIZE] = [0; 2 * TAR_BLOCK_SIZE];

/// The container format of an output archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    Plain,
    Gzip,
    Bzip2,
}

impl ArchiveMode {
    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveMode::Plain => "application/x-tar",
            ArchiveMode::Gzip => "application/gzip",
            ArchiveMode::Bzip2 => "application/x-bzip2",
        }
    }

    /// The full file extension, including the `.tar` part.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveMode::Plain => ".tar",
            ArchiveMode::Gzip => ".tar.gz",
            ArchiveMode::Bzip2 => ".tar.bz2",
        }
    }
}

/// Whether a fragment is the last one of its archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPosition {
    Intermediate,
    /// The end-of-archive marker (and, for compressed modes, the compression trailer of the
    /// last member) follows the entry.
    Final,
}

fn entry_header(name: &str, size: u64, mtime: u64) -> io::Result<Header> {
    let mut header = Header::new_ustar();
    header.set_path(name)?;
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mtime(mtime);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    Ok(header)
}

/// Checks that `name` can be stored in a ustar header.
///
/// Fails with [`Error::Encoding`] for names that are too long or otherwise unrepresentable.
pub fn check_member_name(name: &str) -> Result<()> {
    entry_header(name, 0, 0)
        .map(drop)
        .map_err(|source| Error::Encoding {
            name: name.to_string(),
            source,
        })
}

async fn compress(mut encoder: impl AsyncWrite + Unpin, raw: &[u8]) -> io::Result<()> {
    encoder.write_all(raw).await?;
    // shutdown() finishes the member and writes its trailer
    encoder.shutdown().await
}

async fn finish(raw: Vec<u8>, mode: ArchiveMode) -> io::Result<Vec<u8>> {
    match mode {
        ArchiveMode::Plain => Ok(raw),
        ArchiveMode::Gzip => {
            let mut encoder = GzipEncoder::new(Vec::new());
            compress(&mut encoder, &raw).await?;
            Ok(encoder.into_inner())
        }
        ArchiveMode::Bzip2 => {
            let mut encoder = BzEncoder::new(Vec::new());
            compress(&mut encoder, &raw).await?;
            Ok(encoder.into_inner())
        }
    }
}

/// Wraps `payload` into a tar entry called `name`, compressed according to `mode`.
///
/// Fails with [`Error::Encoding`] if `name` does not fit into a ustar header.
pub async fn encode(
    name: &str,
    payload: &[u8],
    mtime: u64,
    mode: ArchiveMode,
    position: EntryPosition,
) -> Result<Vec<u8>> {
    let encoding_error = |source| Error::Encoding {
        name: name.to_string(),
        source,
    };

    let header = entry_header(name, payload.len() as u64, mtime).map_err(encoding_error)?;

    let storage_size = (payload.len() + TAR_BLOCK_SIZE - 1) & !(TAR_BLOCK_SIZE - 1);
    let mut raw = Vec::with_capacity(TAR_BLOCK_SIZE + storage_size + TAR_END_OF_ARCHIVE.len());
    raw.extend_from_slice(header.as_bytes());
    raw.extend_from_slice(payload);
    raw.resize(TAR_BLOCK_SIZE + storage_size, 0);

    if position == EntryPosition::Final {
        raw.extend_from_slice(&TAR_END_OF_ARCHIVE);
    }

    finish(raw, mode).await.map_err(encoding_error)
}

/// A fragment holding only the end-of-archive marker.
///
/// Used to close an archive whose last entry was written as [`EntryPosition::Intermediate`].
pub async fn terminator(mode: ArchiveMode) -> Result<Vec<u8>> {
    finish(TAR_END_OF_ARCHIVE.to_vec(), mode)
        .await
        .map_err(|source| Error::Encoding {
            name: String::new(),
            source,
        })
}
