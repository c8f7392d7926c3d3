//! One multipart upload: create, upload parts in order, complete.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    error::{Error, Result},
    store::{CompletedPart, ObjectStore},
};

pub struct MultipartUploadSession {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    uploaded_bytes: u64,
}

impl MultipartUploadSession {
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
        content_type: &str,
        storage_class: &str,
    ) -> Result<Self> {
        log::info!("Creating file {key}");
        let upload_id = store
            .create_multipart_upload(bucket, key, content_type, storage_class)
            .await
            .map_err(|e| Error::transport("create multipart upload", key, e))?;
        log::debug!("multipart upload {upload_id} started for {bucket}/{key}");

        Ok(Self {
            store,
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            parts: vec![],
            uploaded_bytes: 0,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    /// Uploads `body` as the next part and returns its ETag.
    pub async fn upload_part(&mut self, body: Bytes) -> Result<String> {
        let part_number = self.parts.len() as i32 + 1;
        let size = body.len() as u64;
        log::info!("Uploading part {part_number} of {} ({size} bytes)", self.key);

        let e_tag = self
            .store
            .upload_part(&self.bucket, &self.key, &self.upload_id, part_number, body)
            .await
            .map_err(|e| Error::transport("upload part", &self.key, e))?;

        self.parts.push(CompletedPart {
            part_number,
            e_tag: e_tag.clone(),
        });
        self.uploaded_bytes += size;
        Ok(e_tag)
    }

    /// Completes the upload.  If that fails the upload is aborted before the error is returned.
    pub async fn complete(self) -> Result<()> {
        match self
            .store
            .complete_multipart_upload(&self.bucket, &self.key, &self.upload_id, &self.parts)
            .await
        {
            Ok(()) => {
                log::debug!(
                    "multipart upload {} of {} completed with {} parts",
                    self.upload_id,
                    self.key,
                    self.parts.len()
                );
                Ok(())
            }
            Err(e) => {
                let error = Error::transport("complete multipart upload", &self.key, e);
                self.abort_quietly().await;
                Err(error)
            }
        }
    }

    pub async fn abort(self) -> Result<()> {
        log::warn!("Aborting upload of {}", self.key);
        self.store
            .abort_multipart_upload(&self.bucket, &self.key, &self.upload_id)
            .await
            .map_err(|e| Error::transport("abort multipart upload", &self.key, e))
    }

    /// Aborts, logging rather than returning a failure to do so.
    pub async fn abort_quietly(self) {
        let key = self.key.clone();
        if let Err(e) = self.abort().await {
            log::error!("failed to abort upload of {key}: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{store::memory::MemoryStore, MIN_PART_SIZE};

    async fn open(store: &Arc<MemoryStore>) -> MultipartUploadSession {
        MultipartUploadSession::open(
            Arc::clone(store) as Arc<dyn ObjectStore>,
            "my-archive",
            "archive.tar",
            "application/x-tar",
            "STANDARD",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_success() {
        let store = Arc::new(MemoryStore::new());
        let mut mpu = open(&store).await;
        mpu.upload_part(Bytes::from_static(b"hello World!"))
            .await
            .unwrap();
        assert_eq!(mpu.parts().len(), 1);
        assert_eq!(mpu.parts()[0].part_number, 1);
        mpu.complete().await.unwrap();

        let object = store.object("my-archive", "archive.tar").unwrap();
        assert_eq!(&object.data[..], &b"hello World!"[..]);
        assert_eq!(object.content_type.as_deref(), Some("application/x-tar"));
    }

    #[tokio::test]
    async fn test_part_numbers_are_sequential() {
        let store = Arc::new(MemoryStore::new());
        let mut mpu = open(&store).await;
        let big = Bytes::from(vec![1u8; MIN_PART_SIZE as usize]);
        mpu.upload_part(big.clone()).await.unwrap();
        mpu.upload_part(big).await.unwrap();
        mpu.upload_part(Bytes::from_static(b"tail")).await.unwrap();

        let numbers: Vec<i32> = mpu.parts().iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(mpu.uploaded_bytes(), 2 * MIN_PART_SIZE + 4);
        mpu.complete().await.unwrap();

        let object = store.object("my-archive", "archive.tar").unwrap();
        assert_eq!(object.data.len() as u64, 2 * MIN_PART_SIZE + 4);
        assert!(object.data.ends_with(b"tail"));
    }

    #[tokio::test]
    async fn test_complete_too_small_aborts() {
        let store = Arc::new(MemoryStore::new());
        let mut mpu = open(&store).await;
        let upload_id = mpu.upload_id().to_string();
        mpu.upload_part(Bytes::new()).await.unwrap();
        mpu.upload_part(Bytes::new()).await.unwrap();

        let err = mpu.complete().await.unwrap_err();
        assert!(matches!(err, Error::Transport { op: "complete multipart upload", .. }));
        assert!(err.to_string().contains("EntityTooSmall"));
        assert_eq!(store.aborted_uploads(), vec![upload_id]);
        assert_eq!(store.open_uploads(), 0);
        assert!(store.object("my-archive", "archive.tar").is_none());
    }

    #[tokio::test]
    async fn test_failed_part_is_not_recorded() {
        let store = Arc::new(MemoryStore::new());
        let mut mpu = open(&store).await;
        store.fail_part_uploads(true);

        let err = mpu.upload_part(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::Transport { op: "upload part", .. }));
        assert!(mpu.parts().is_empty());

        mpu.abort().await.unwrap();
        assert_eq!(store.open_uploads(), 0);
    }
}
