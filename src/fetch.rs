//! Background fetching of source objects into a bounded queue of encoded entries.
//!
//! A driver task fans the pending entries out over a [`pool`](crate::pool) of `cache_size`
//! workers.  Each worker reserves a queue slot before it starts downloading, so no more than
//! `cache_size` encoded entries (plus the closing entry) are ever held in memory.  The entry
//! that closes the archive is set aside up front.  It is fetched alongside the others but only
//! queued once every other entry has been, which keeps the end-of-archive marker on the very
//! last chunk.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    encoder::{self, ArchiveMode, EntryPosition},
    error::{Error, Result},
    keys::SourceEntry,
    pool::{self, TaskOutcome},
    store::ObjectStore,
};

/// One source object, tar-encoded and ready to be appended to an archive.
#[derive(Debug)]
pub struct EncodedEntry {
    pub entry: SourceEntry,
    /// The `<member>.metadata.json` entry, if the object has metadata and it was asked for.
    pub sidecar: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

/// What the archive writer receives from the queue.
#[derive(Debug)]
pub enum ArchiveChunk {
    Entry(EncodedEntry),
    /// A bare end-of-archive marker, sent when the entry meant to close the archive failed.
    Terminator(Vec<u8>),
}

impl ArchiveChunk {
    pub fn len(&self) -> usize {
        match self {
            ArchiveChunk::Entry(e) => e.sidecar.as_ref().map_or(0, Vec::len) + e.data.len(),
            ArchiveChunk::Terminator(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the encoded bytes to `buf`, sidecar first.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            ArchiveChunk::Entry(e) => {
                if let Some(sidecar) = &e.sidecar {
                    buf.extend_from_slice(sidecar);
                }
                buf.extend_from_slice(&e.data);
            }
            ArchiveChunk::Terminator(bytes) => buf.extend_from_slice(bytes),
        }
    }

    pub fn source(&self) -> Option<&SourceEntry> {
        match self {
            ArchiveChunk::Entry(e) => Some(&e.entry),
            ArchiveChunk::Terminator(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub cache_size: usize,
    pub mode: ArchiveMode,
    pub save_metadata: bool,
}

/// Which entries made it into the queue, and which were given up on.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub archived: Vec<SourceEntry>,
    pub failed: Vec<(SourceEntry, anyhow::Error)>,
}

impl FetchReport {
    fn record(&mut self, outcome: TaskOutcome<SourceEntry, SourceEntry>) {
        match outcome {
            TaskOutcome::Done(entry) => self.archived.push(entry),
            TaskOutcome::Failed { item, error } => {
                log::error!("dropping {} from the archive: {error:#}", item.key);
                self.failed.push((item, error));
            }
        }
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Downloads and encodes one entry.
async fn fetch_entry(
    store: &dyn ObjectStore,
    bucket: &str,
    entry: &SourceEntry,
    options: &FetchOptions,
    position: EntryPosition,
) -> anyhow::Result<EncodedEntry> {
    let head = store.head_object(bucket, &entry.key).await?;

    let sidecar = if options.save_metadata && !head.metadata.is_empty() {
        let json = serde_json::to_vec(&head.metadata)
            .with_context(|| format!("serializing metadata of {}", entry.key))?;
        let sidecar = encoder::encode(
            &entry.sidecar_member(),
            &json,
            now(),
            options.mode,
            EntryPosition::Intermediate,
        )
        .await?;
        Some(sidecar)
    } else {
        None
    };

    let body = store.get_object(bucket, &entry.key).await?;
    let mtime = head.last_modified.unwrap_or_else(now);
    let data = encoder::encode(&entry.member, &body, mtime, options.mode, position).await?;
    log::debug!("fetched {} ({} bytes) as {}", entry.key, body.len(), entry.member);

    Ok(EncodedEntry {
        entry: entry.clone(),
        sidecar,
        data,
    })
}

/// Handle to a running fetch: the receiving end of the queue plus the driver task.
pub struct Fetcher {
    receiver: mpsc::Receiver<ArchiveChunk>,
    driver: JoinHandle<FetchReport>,
}

impl Fetcher {
    /// Starts fetching `entries` from `bucket` in the background.
    ///
    /// The last entry of `entries` closes the archive.  With no entries nothing is queued.
    pub fn start(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        mut entries: Vec<SourceEntry>,
        options: FetchOptions,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(options.cache_size.max(1));
        let bucket = bucket.to_string();

        let driver = tokio::spawn(async move {
            let mut report = FetchReport::default();
            let Some(last) = entries.pop() else {
                return report;
            };

            let worker_store = Arc::clone(&store);
            let worker_bucket = bucket.clone();
            let worker_sender = sender.clone();
            let worker_options = options.clone();
            let mode = options.mode;
            let workers = pool::run(options.cache_size, entries, move |entry: SourceEntry| {
                let store = Arc::clone(&worker_store);
                let bucket = worker_bucket.clone();
                let sender = worker_sender.clone();
                let options = worker_options.clone();
                async move {
                    let permit = sender.reserve().await.context("archive writer went away")?;
                    let encoded = fetch_entry(
                        store.as_ref(),
                        &bucket,
                        &entry,
                        &options,
                        EntryPosition::Intermediate,
                    )
                    .await?;
                    permit.send(ArchiveChunk::Entry(encoded));
                    anyhow::Ok(entry)
                }
            });
            let closing = pool::run(1, [last], move |entry: SourceEntry| {
                let store = Arc::clone(&store);
                let bucket = bucket.clone();
                let options = options.clone();
                async move {
                    let encoded = fetch_entry(
                        store.as_ref(),
                        &bucket,
                        &entry,
                        &options,
                        EntryPosition::Final,
                    )
                    .await?;
                    anyhow::Ok((entry, encoded))
                }
            });

            let (outcomes, closing) = tokio::join!(workers, closing);
            for outcome in outcomes {
                report.record(outcome);
            }

            // every other entry is queued by now, so this one is last
            for outcome in closing {
                let chunk = match outcome {
                    TaskOutcome::Done((entry, encoded)) => {
                        report.archived.push(entry);
                        ArchiveChunk::Entry(encoded)
                    }
                    TaskOutcome::Failed { item, error } => {
                        log::error!("dropping {} from the archive: {error:#}", item.key);
                        report.failed.push((item, error));
                        match encoder::terminator(mode).await {
                            Ok(bytes) => ArchiveChunk::Terminator(bytes),
                            Err(e) => {
                                log::error!("failed to encode the end of the archive: {e}");
                                continue;
                            }
                        }
                    }
                };
                if sender.send(chunk).await.is_err() {
                    log::warn!("archive writer went away before the last entry");
                }
            }

            report
        });

        Self { receiver, driver }
    }

    /// The next chunk in queue order, or `None` once everything has been fetched.
    pub async fn next(&mut self) -> Option<ArchiveChunk> {
        self.receiver.recv().await
    }

    /// Waits for the driver and returns its report.
    ///
    /// Chunks that were not received yet are discarded.
    pub async fn finish(mut self) -> Result<FetchReport> {
        self.receiver.close();
        while self.receiver.recv().await.is_some() {}
        self.driver
            .await
            .map_err(|e| Error::Fetcher(e.to_string()))
    }

    /// Stops the driver and its workers without waiting for them.
    pub fn abort(self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{encoder::TAR_END_OF_ARCHIVE, store::memory::MemoryStore};

    const BUCKET: &str = "my-bucket";

    fn options(cache_size: usize, save_metadata: bool) -> FetchOptions {
        FetchOptions {
            cache_size,
            mode: ArchiveMode::Plain,
            save_metadata,
        }
    }

    fn members(raw: &[u8]) -> Vec<String> {
        tar::Archive::new(raw)
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    async fn drain(mut fetcher: Fetcher) -> (Vec<ArchiveChunk>, FetchReport) {
        let mut chunks = vec![];
        while let Some(chunk) = fetcher.next().await {
            chunks.push(chunk);
        }
        let report = fetcher.finish().await.unwrap();
        (chunks, report)
    }

    fn store_with(names: &[&str]) -> (Arc<MemoryStore>, Vec<SourceEntry>) {
        let store = Arc::new(MemoryStore::new());
        let entries = names
            .iter()
            .map(|name| {
                let key = format!("src/{name}");
                store.put_object(BUCKET, &key, format!("contents of {name}").into_bytes());
                SourceEntry::new(*name, key)
            })
            .collect();
        (store, entries)
    }

    #[tokio::test]
    async fn test_last_entry_closes_archive() {
        let (store, entries) = store_with(&["a", "b", "c", "d", "e"]);
        let fetcher = Fetcher::start(store, BUCKET, entries, options(2, false));
        let (chunks, report) = drain(fetcher).await;

        assert_eq!(chunks.len(), 5);
        assert_eq!(report.archived.len(), 5);
        assert!(report.failed.is_empty());
        assert_eq!(chunks.last().unwrap().source().unwrap().member, "e");

        let mut raw = vec![];
        for chunk in &chunks {
            chunk.write_to(&mut raw);
        }
        assert!(raw.ends_with(&TAR_END_OF_ARCHIVE));
        let mut found = members(&raw);
        found.sort();
        assert_eq!(found, ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_sidecar_only_with_metadata() {
        let store = Arc::new(MemoryStore::new());
        store.put_object_with_metadata(
            BUCKET,
            "with-meta",
            b"data".to_vec(),
            BTreeMap::from([("color".to_string(), "blue".to_string())]),
        );
        store.put_object(BUCKET, "without-meta", b"data".to_vec());
        let entries = vec![
            SourceEntry::new("with.txt", "with-meta"),
            SourceEntry::new("without.txt", "without-meta"),
        ];

        let fetcher = Fetcher::start(store, BUCKET, entries, options(1, true));
        let (chunks, _) = drain(fetcher).await;

        let mut raw = vec![];
        for chunk in &chunks {
            chunk.write_to(&mut raw);
        }
        assert_eq!(
            members(&raw),
            ["with.txt.metadata.json", "with.txt", "without.txt"]
        );

        let mut archive = tar::Archive::new(&raw[..]);
        let mut first = archive.entries().unwrap().next().unwrap().unwrap();
        let mut json = String::new();
        std::io::Read::read_to_string(&mut first, &mut json).unwrap();
        assert_eq!(json, r#"{"color":"blue"}"#);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_reported() {
        let (store, entries) = store_with(&["a", "b", "c"]);
        store.fail_gets_for(BUCKET, "src/b");
        let fetcher = Fetcher::start(store, BUCKET, entries, options(3, false));
        let (chunks, report) = drain(fetcher).await;

        assert_eq!(chunks.len(), 2);
        let mut archived: Vec<&str> = report.archived.iter().map(|e| e.member.as_str()).collect();
        archived.sort();
        assert_eq!(archived, ["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.key, "src/b");
    }

    #[tokio::test]
    async fn test_failed_last_entry_still_terminates() {
        let (store, entries) = store_with(&["a", "b"]);
        store.fail_gets_for(BUCKET, "src/b");
        let fetcher = Fetcher::start(store, BUCKET, entries, options(2, false));
        let (chunks, report) = drain(fetcher).await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], ArchiveChunk::Terminator(_)));
        assert_eq!(report.failed.len(), 1);

        let mut raw = vec![];
        for chunk in &chunks {
            chunk.write_to(&mut raw);
        }
        assert_eq!(members(&raw), ["a"]);
        assert!(raw.ends_with(&TAR_END_OF_ARCHIVE));
    }

    #[tokio::test]
    async fn test_nothing_to_fetch() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Fetcher::start(store, BUCKET, vec![], options(5, false));
        let (chunks, report) = drain(fetcher).await;
        assert!(chunks.is_empty());
        assert!(report.archived.is_empty());
        assert!(report.failed.is_empty());
    }

    /// Delays every GET and records the order in which they start.
    struct SlowStore {
        inner: MemoryStore,
        started: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for SlowStore {
        async fn list_objects(
            &self,
            bucket: &str,
            prefix: &str,
            continuation: Option<&str>,
        ) -> anyhow::Result<crate::store::ListPage> {
            self.inner.list_objects(bucket, prefix, continuation).await
        }

        async fn head_object(&self, bucket: &str, key: &str) -> anyhow::Result<crate::store::ObjectHead> {
            self.inner.head_object(bucket, key).await
        }

        async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<bytes::Bytes> {
            self.started.lock().unwrap().push(key.to_string());
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.inner.get_object(bucket, key).await
        }

        async fn create_multipart_upload(
            &self,
            bucket: &str,
            key: &str,
            content_type: &str,
            storage_class: &str,
        ) -> anyhow::Result<String> {
            self.inner
                .create_multipart_upload(bucket, key, content_type, storage_class)
                .await
        }

        async fn upload_part(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            part_number: i32,
            body: bytes::Bytes,
        ) -> anyhow::Result<String> {
            self.inner
                .upload_part(bucket, key, upload_id, part_number, body)
                .await
        }

        async fn complete_multipart_upload(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            parts: &[crate::store::CompletedPart],
        ) -> anyhow::Result<()> {
            self.inner
                .complete_multipart_upload(bucket, key, upload_id, parts)
                .await
        }

        async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> anyhow::Result<()> {
            self.inner.abort_multipart_upload(bucket, key, upload_id).await
        }

        async fn delete_objects(&self, bucket: &str, keys: &[String]) -> anyhow::Result<()> {
            self.inner.delete_objects(bucket, keys).await
        }
    }

    #[tokio::test]
    async fn test_closing_entry_fetched_alongside_others() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            started: Default::default(),
        });
        let mut entries = vec![];
        for name in ["a", "b", "c", "last"] {
            store.inner.put_object(BUCKET, name, name.as_bytes().to_vec());
            entries.push(SourceEntry::new(name, name));
        }

        let fetcher = Fetcher::start(Arc::clone(&store) as Arc<dyn ObjectStore>, BUCKET, entries, options(1, false));
        let (chunks, report) = drain(fetcher).await;

        // one worker handles a, b and c one after the other; the closing entry does not wait
        let started = store.started.lock().unwrap().clone();
        let position = started.iter().position(|key| key == "last").unwrap();
        assert!(position < 2, "closing entry started late: {started:?}");

        assert_eq!(report.archived.len(), 4);
        assert_eq!(chunks.last().unwrap().source().unwrap().member, "last");
    }
}
