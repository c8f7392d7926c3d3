//! Turning a set of registered source objects into one or more archives.
//!
//! [`ArchivePlanner`] collects source keys, then [`run`](ArchivePlanner::run)s the pipeline:
//! a [`Fetcher`] encodes sources in the background while the planner packs the encoded entries
//! into parts and uploads them.  Parts are uploaded as soon as they reach the configured part
//! size.  With a minimum file size configured an archive is closed (and a new one opened) once
//! it has grown past that size.

use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use indicatif::ProgressBar;

use crate::{
    config::{ArchiveConfig, ArchiveOutput},
    encoder,
    error::{Error, Result},
    fetch::{ArchiveChunk, FetchOptions, Fetcher},
    keys::{member_for_key, member_for_listed_key, PendingKeySet, SourceEntry},
    mpu::MultipartUploadSession,
    store::{ObjectStore, MAX_DELETE_BATCH},
};

/// What a successful run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Keys of the archives written, in order.
    pub archives: Vec<String>,
    /// Number of source objects archived.
    pub entries: usize,
    /// Bytes uploaded across all archives.
    pub bytes: u64,
    /// Number of source objects deleted afterwards.
    pub deleted: usize,
}

pub struct ArchivePlanner {
    store: Arc<dyn ObjectStore>,
    config: ArchiveConfig,
    output: ArchiveOutput,
    pending: PendingKeySet,
    progress: Option<ProgressBar>,
}

impl ArchivePlanner {
    /// Validates `config`; a bad target extension or option is reported here, before any
    /// request is made.
    pub fn new(store: Arc<dyn ObjectStore>, config: ArchiveConfig) -> Result<Self> {
        let output = config.validate()?;
        Ok(Self {
            store,
            config,
            output,
            pending: PendingKeySet::new(),
            progress: None,
        })
    }

    /// Reports progress on `bar`: its length is set to the number of entries when the run
    /// starts, and it advances once per archived entry.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Number of registered source objects.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SourceEntry> {
        self.pending.iter()
    }

    /// Registers a single object.  It is stored under its file name, inside `folder` if that is
    /// not empty.
    pub fn add_file(&mut self, key: &str, folder: &str) -> Result<()> {
        let entry = SourceEntry::new(member_for_key(key, folder), key);
        if self.register(entry)? {
            log::debug!("added {key}");
        }
        Ok(())
    }

    /// Adds `entry` once its archive names are known to fit into a tar header.
    fn register(&mut self, entry: SourceEntry) -> Result<bool> {
        encoder::check_member_name(&entry.member)?;
        if self.config.save_metadata {
            encoder::check_member_name(&entry.sidecar_member())?;
        }
        self.pending.insert(entry, self.config.allow_dups)
    }

    /// Registers every object below `prefix` and returns how many were found.
    ///
    /// Objects keep their path relative to `prefix` with `preserve_paths`, otherwise only their
    /// file name.  Folder markers (keys ending in `/`) are skipped.
    pub async fn add_files(&mut self, prefix: &str, folder: &str, preserve_paths: bool) -> Result<usize> {
        let bucket = self.config.source_bucket.clone();
        let mut found = 0;
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .store
                .list_objects(&bucket, prefix, continuation.as_deref())
                .await
                .map_err(|e| Error::transport("list objects", prefix, e))?;

            for key in page.keys {
                if key == prefix || key.ends_with('/') {
                    continue;
                }
                let member = member_for_listed_key(&key, prefix, folder, preserve_paths);
                self.register(SourceEntry::new(member, key))?;
                found += 1;
            }

            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        if found == 0 {
            log::warn!("No files found in {bucket}/{prefix}");
        } else {
            log::info!("Found {found} files in {bucket}/{prefix}");
        }
        Ok(found)
    }

    /// Archives every registered object, then removes the sources if asked to.
    ///
    /// Objects that cannot be fetched are left out of the archive; the run still writes the
    /// archive but then fails with [`Error::IncompleteArchive`] and deletes nothing.  Archives
    /// completed before an upload error are left in place.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let entries = self.pending.drain();
        let mut summary = RunSummary::default();
        if entries.is_empty() {
            log::warn!("Nothing to archive");
            return Ok(summary);
        }

        log::info!(
            "Archiving {} objects from {} to {}/{}",
            entries.len(),
            self.config.source_bucket,
            self.config.target_bucket(),
            self.config.target_key
        );
        if let Some(bar) = &self.progress {
            bar.set_length(entries.len() as u64);
        }

        let mut fetcher = Fetcher::start(
            Arc::clone(&self.store),
            &self.config.source_bucket,
            entries,
            FetchOptions {
                cache_size: self.config.cache_size,
                mode: self.output.mode(),
                save_metadata: self.config.save_metadata,
            },
        );

        if let Err(e) = self.write_archives(&mut fetcher, &mut summary).await {
            fetcher.abort();
            return Err(e);
        }

        let report = fetcher.finish().await?;
        if !report.failed.is_empty() {
            return Err(Error::IncompleteArchive {
                failed: report.failed.into_iter().map(|(entry, _)| entry.key).collect(),
            });
        }

        if self.config.remove_keys {
            summary.deleted = self.remove_sources(&report.archived).await?;
        }
        log::info!(
            "Wrote {} entries ({} bytes) to {} archive(s)",
            summary.entries,
            summary.bytes,
            summary.archives.len()
        );
        Ok(summary)
    }

    async fn write_archives(&self, fetcher: &mut Fetcher, summary: &mut RunSummary) -> Result<()> {
        // one chunk of lookahead, so an archive is only opened when there is something to put in it
        let mut next = fetcher.next().await;
        let mut file_number = 0;

        while next.is_some() {
            file_number += 1;
            let key = self.output.path_for(file_number);
            if let Some(bar) = &self.progress {
                bar.set_message(key.clone());
            }

            let mut session = MultipartUploadSession::open(
                Arc::clone(&self.store),
                self.config.target_bucket(),
                &key,
                self.output.content_type(),
                &self.config.storage_class,
            )
            .await?;

            match self.write_archive(&mut session, fetcher, &mut next, summary).await {
                Ok(()) => {
                    summary.bytes += session.uploaded_bytes();
                    session.complete().await?;
                }
                Err(e) => {
                    session.abort_quietly().await;
                    return Err(e);
                }
            }
            log::info!("Completed {key}");
            summary.archives.push(key);
        }
        Ok(())
    }

    /// Uploads parts to `session` until the input runs out or the archive is large enough.
    async fn write_archive(
        &self,
        session: &mut MultipartUploadSession,
        fetcher: &mut Fetcher,
        next: &mut Option<ArchiveChunk>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let part_size = self.config.part_size();
        let mut archive_size = 0u64;

        loop {
            let mut part = Vec::new();
            while let Some(chunk) = next.take() {
                chunk.write_to(&mut part);
                if chunk.source().is_some() {
                    summary.entries += 1;
                    if let Some(bar) = &self.progress {
                        bar.inc(1);
                    }
                }
                *next = fetcher.next().await;
                if part.len() as u64 >= part_size {
                    break;
                }
            }
            archive_size += part.len() as u64;

            let exhausted = is_exhausted(next);
            let large_enough = self
                .config
                .min_file_size
                .is_some_and(|min| archive_size >= min);

            if exhausted {
                // a terminator standing in for a failed closing entry belongs to this archive
                if let Some(chunk) = next.take() {
                    chunk.write_to(&mut part);
                }
            } else if large_enough {
                // more archives follow; this one needs its own end marker
                part.extend(encoder::terminator(self.output.mode()).await?);
            }
            session.upload_part(Bytes::from(part)).await?;

            if exhausted || large_enough {
                return Ok(());
            }
        }
    }

    async fn remove_sources(&self, archived: &[SourceEntry]) -> Result<usize> {
        let bucket = &self.config.source_bucket;
        let keys: Vec<String> = archived
            .iter()
            .map(|entry| entry.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for batch in keys.chunks(MAX_DELETE_BATCH) {
            log::info!("Deleting {} keys from {bucket}", batch.len());
            self.store
                .delete_objects(bucket, batch)
                .await
                .map_err(|e| Error::transport("delete objects", bucket.as_str(), e))?;
        }
        Ok(keys.len())
    }
}

/// True when nothing but (at most) the end-of-archive marker is left to write.
fn is_exhausted(next: &Option<ArchiveChunk>) -> bool {
    matches!(next, None | Some(ArchiveChunk::Terminator(_)))
}
