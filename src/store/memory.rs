//! An in-process [`ObjectStore`].
//!
//! Behaves like S3 where the archiver cares: listings are paginated and sorted, multipart
//! uploads reject non-final parts below the minimum part size on completion, and bulk deletes
//! are limited to [`MAX_DELETE_BATCH`] keys.  It also records what happened (delete batches,
//! aborted uploads) and can be told to fail reads or part uploads.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, ensure, Context, Result};
use bytes::{Bytes, BytesMut};

use super::{CompletedPart, ListPage, ObjectHead, ObjectStore, MAX_DELETE_BATCH};
use crate::MIN_PART_SIZE;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub metadata: BTreeMap<String, String>,
    pub last_modified: u64,
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug)]
struct Upload {
    bucket: String,
    key: String,
    content_type: String,
    storage_class: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, Upload>,
    next_upload_id: u64,
    failing_gets: HashSet<(String, String)>,
    fail_part_uploads: bool,
    delete_batches: Vec<usize>,
    aborted: Vec<String>,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    min_part_size: u64,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::default(),
            min_part_size: MIN_PART_SIZE,
            page_size: 1000,
        }
    }

    /// Limits how many keys a single listing page returns.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.put_object_with_metadata(bucket, key, data, BTreeMap::new());
    }

    pub fn put_object_with_metadata(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        metadata: BTreeMap<String, String>,
    ) {
        self.lock().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                metadata,
                last_modified: now(),
                content_type: None,
                storage_class: None,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// All keys currently stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Makes every future GET of this object fail.
    pub fn fail_gets_for(&self, bucket: &str, key: &str) {
        self.lock()
            .failing_gets
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Makes every future part upload fail.
    pub fn fail_part_uploads(&self, fail: bool) {
        self.lock().fail_part_uploads = fail;
    }

    /// The size of every bulk delete request received so far.
    pub fn delete_batches(&self) -> Vec<usize> {
        self.lock().delete_batches.clone()
    }

    /// Upload ids of aborted multipart uploads.
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    /// Number of multipart uploads that were created but neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage> {
        let inner = self.lock();
        let mut matching = inner
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k)
            .filter(|k| continuation.map_or(true, |after| k.as_str() > after));

        let keys: Vec<String> = matching.by_ref().take(self.page_size).cloned().collect();
        let continuation = match matching.next() {
            Some(_) => keys.last().cloned(),
            None => None,
        };

        Ok(ListPage { keys, continuation })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let inner = self.lock();
        let object = inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .with_context(|| format!("NoSuchKey: {bucket}/{key}"))?;

        Ok(ObjectHead {
            metadata: object.metadata.clone(),
            last_modified: Some(object.last_modified),
            size: Some(object.data.len() as u64),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let inner = self.lock();
        let id = (bucket.to_string(), key.to_string());
        if inner.failing_gets.contains(&id) {
            bail!("InternalError: injected failure reading {bucket}/{key}");
        }
        let object = inner
            .objects
            .get(&id)
            .with_context(|| format!("NoSuchKey: {bucket}/{key}"))?;
        Ok(object.data.clone())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<String> {
        let mut inner = self.lock();
        inner.next_upload_id += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);
        inner.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: content_type.to_string(),
                storage_class: storage_class.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        let mut inner = self.lock();
        if inner.fail_part_uploads {
            bail!("InternalError: injected failure uploading part {part_number} of {bucket}/{key}");
        }
        ensure!(
            (1..=10000).contains(&part_number),
            "InvalidArgument: part number {part_number}"
        );
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .with_context(|| format!("NoSuchUpload: {upload_id}"))?;
        ensure!(
            upload.bucket == bucket && upload.key == key,
            "NoSuchUpload: {upload_id} is not for {bucket}/{key}"
        );

        let e_tag = format!("\"{upload_id}-{part_number}-{}\"", body.len());
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get(upload_id)
            .with_context(|| format!("NoSuchUpload: {upload_id}"))?;
        ensure!(
            upload.bucket == bucket && upload.key == key,
            "NoSuchUpload: {upload_id} is not for {bucket}/{key}"
        );
        ensure!(!parts.is_empty(), "MalformedXML: no parts given");

        let mut data = BytesMut::new();
        let mut previous = 0;
        for (idx, part) in parts.iter().enumerate() {
            ensure!(
                part.part_number > previous,
                "InvalidPartOrder: part {} listed after {previous}",
                part.part_number
            );
            previous = part.part_number;

            let Some((e_tag, body)) = upload.parts.get(&part.part_number) else {
                bail!("InvalidPart: part {} was never uploaded", part.part_number);
            };
            ensure!(
                *e_tag == part.e_tag,
                "InvalidPart: ETag mismatch for part {}",
                part.part_number
            );
            if idx + 1 < parts.len() && (body.len() as u64) < self.min_part_size {
                bail!(
                    "EntityTooSmall: part {} is {} bytes, minimum is {}",
                    part.part_number,
                    body.len(),
                    self.min_part_size
                );
            }
            data.extend_from_slice(body);
        }

        let object = StoredObject {
            data: data.freeze(),
            metadata: BTreeMap::new(),
            last_modified: now(),
            content_type: Some(upload.content_type.clone()),
            storage_class: Some(upload.storage_class.clone()),
        };
        inner.uploads.remove(upload_id);
        inner
            .objects
            .insert((bucket.to_string(), key.to_string()), object);
        Ok(())
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .uploads
            .remove(upload_id)
            .with_context(|| format!("NoSuchUpload: {upload_id}"))?;
        inner.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        ensure!(
            keys.len() <= MAX_DELETE_BATCH,
            "MalformedXML: {} keys in one delete request",
            keys.len()
        );
        let mut inner = self.lock();
        inner.delete_batches.push(keys.len());
        for key in keys {
            inner.objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }
}
