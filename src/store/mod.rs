//! The object store the archiver reads sources from and writes archives to.
//!
//! [`ObjectStore`] is the narrow set of primitives the pipeline needs.  Implementations are
//! expected to carry their own transport-level retry policy; nothing above this layer retries
//! multipart or delete calls.

pub mod memory;
pub mod s3;

use std::collections::BTreeMap;

use anyhow::Result;
use bytes::Bytes;

/// Maximum number of keys accepted by one bulk delete request.
pub const MAX_DELETE_BATCH: usize = 1000;

/// What a HEAD request tells us about an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    /// User-defined metadata.  Empty if the object has none.
    pub metadata: BTreeMap<String, String>,
    /// Seconds since the epoch.
    pub last_modified: Option<u64>,
    pub size: Option<u64>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Set when more keys follow; pass it back to fetch the next page.
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: String,
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<String>;

    /// Uploads one part and returns its ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;

    /// Deletes up to [`MAX_DELETE_BATCH`] keys in one request.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;
}
