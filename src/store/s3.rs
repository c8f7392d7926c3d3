//! [`ObjectStore`] on top of the AWS SDK.
//!
//! Region and credentials come from the usual AWS environment.  Setting `S3_ENDPOINT_URL` points
//! the client at an S3-compatible service instead, with path-style addressing.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use aws_config::{retry::RetryConfig, BehaviorVersion};
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{CompletedMultipartUpload, Delete, ObjectIdentifier, StorageClass},
    Client,
};
use bytes::Bytes;
use tokio::sync::Semaphore;

use super::{CompletedPart, ListPage, ObjectHead, ObjectStore};

pub const ENDPOINT_URL_VAR: &str = "S3_ENDPOINT_URL";

pub struct S3Store {
    client: Client,
    inflight: Arc<Semaphore>,
}

impl S3Store {
    /// Builds a client that keeps at most `max_inflight` requests outstanding and lets the SDK
    /// make up to `max_attempts` attempts per request.
    pub async fn connect(max_inflight: usize, max_attempts: u32) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(max_attempts))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Ok(endpoint) = std::env::var(ENDPOINT_URL_VAR) {
            log::debug!("using S3 endpoint {endpoint}");
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::from_client(Client::from_conf(builder.build()), max_inflight)
    }

    pub fn from_client(client: Client, max_inflight: usize) -> Self {
        Self {
            client,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage> {
        let _permit = self.inflight.acquire().await?;
        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation.map(str::to_string))
            .send()
            .await
            .with_context(|| format!("listing s3://{bucket}/{prefix}"))?;

        Ok(ListPage {
            keys: resp
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_string))
                .collect(),
            continuation: resp.next_continuation_token().map(str::to_string),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let _permit = self.inflight.acquire().await?;
        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("HEAD s3://{bucket}/{key}"))?;

        Ok(ObjectHead {
            metadata: resp
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            last_modified: resp
                .last_modified()
                .and_then(|t| u64::try_from(t.secs()).ok()),
            size: resp.content_length().and_then(|s| u64::try_from(s).ok()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let _permit = self.inflight.acquire().await?;
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("GET s3://{bucket}/{key}"))?;

        let body = resp
            .body
            .collect()
            .await
            .with_context(|| format!("reading body of s3://{bucket}/{key}"))?;
        Ok(body.into_bytes())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<String> {
        let _permit = self.inflight.acquire().await?;
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .storage_class(StorageClass::from(storage_class))
            .send()
            .await
            .with_context(|| format!("creating multipart upload for s3://{bucket}/{key}"))?;

        match resp.upload_id() {
            Some(id) => Ok(id.to_string()),
            None => bail!("no upload id returned for s3://{bucket}/{key}"),
        }
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        let _permit = self.inflight.acquire().await?;
        let resp = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("uploading part {part_number} of s3://{bucket}/{key}"))?;

        match resp.e_tag() {
            Some(e_tag) => Ok(e_tag.to_string()),
            None => bail!("no ETag returned for part {part_number} of s3://{bucket}/{key}"),
        }
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let parts = parts
            .iter()
            .map(|part| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.e_tag)
                    .build()
            })
            .collect();

        let _permit = self.inflight.acquire().await?;
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("completing multipart upload of s3://{bucket}/{key}"))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let _permit = self.inflight.acquire().await?;
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .with_context(|| format!("aborting multipart upload of s3://{bucket}/{key}"))?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()?;

        let _permit = self.inflight.acquire().await?;
        let resp = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .with_context(|| format!("deleting {} keys from s3://{bucket}", keys.len()))?;

        // quiet mode only reports the keys that could not be deleted
        let failed: Vec<&str> = resp.errors().iter().filter_map(|e| e.key()).collect();
        if !failed.is_empty() {
            bail!("failed to delete from s3://{bucket}: {}", failed.join(", "));
        }
        Ok(())
    }
}
