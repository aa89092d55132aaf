//! Artifact storage for exported comment files.
//!
//! Two backends: GCS (signed download URLs) and a local directory served by
//! the `/media` route, selected by whether `LOCAL_STORAGE_PATH` is set.

use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::client::Storage;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::error::{AppError, ResultExt};

/// Opaque reference to an uploaded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub key: String,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(
        &self,
        namespace: &str,
        name: &str,
        data: Bytes,
    ) -> Result<ArtifactHandle, AppError>;

    /// Mint a time-limited retrieval URL.
    async fn presign(&self, handle: &ArtifactHandle, ttl_secs: u32) -> Result<String, AppError>;

    async fn delete(&self, handle: &ArtifactHandle) -> Result<(), AppError>;
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace.trim_end_matches('/'), name)
}

pub struct GcsArtifactStore {
    gcs: Storage,
    bucket_name: String,
    timeout: Duration,
}

impl GcsArtifactStore {
    pub fn new(gcs: Storage, bucket_name: &str, timeout: Duration) -> Self {
        Self {
            gcs,
            bucket_name: bucket_name.to_string(),
            timeout,
        }
    }

    async fn bounded<T, E, F>(&self, context: &str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, E>> + Send,
        E: std::fmt::Display,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .storage(context)?
            .storage(context)
    }
}

#[async_trait]
impl ArtifactStore for GcsArtifactStore {
    async fn upload(
        &self,
        namespace: &str,
        name: &str,
        data: Bytes,
    ) -> Result<ArtifactHandle, AppError> {
        let key = object_key(namespace, name);
        let bucket = format!("projects/_/buckets/{}", self.bucket_name);

        self.bounded(
            "GCS write",
            self.gcs.write_object(&bucket, &key, data).send_buffered(),
        )
        .await?;

        Ok(ArtifactHandle { key })
    }

    async fn presign(&self, handle: &ArtifactHandle, ttl_secs: u32) -> Result<String, AppError> {
        // Signed URLs come from the cloud-storage crate
        let client = cloud_storage::Client::default();
        let object = self
            .bounded(
                "Object read",
                client.object().read(&self.bucket_name, &handle.key),
            )
            .await?;

        object.download_url(ttl_secs).storage("Signed URL")
    }

    async fn delete(&self, handle: &ArtifactHandle) -> Result<(), AppError> {
        let client = cloud_storage::Client::default();
        self.bounded(
            "Object delete",
            client.object().delete(&self.bucket_name, &handle.key),
        )
        .await
    }
}

pub struct LocalArtifactStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: PathBuf, public_base_url: &str) -> Self {
        Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn upload(
        &self,
        namespace: &str,
        name: &str,
        data: Bytes,
    ) -> Result<ArtifactHandle, AppError> {
        let key = object_key(namespace, name);
        let full_path = self.root.join(&key);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .storage("Create export directory")?;
        }
        tokio::fs::write(&full_path, &data)
            .await
            .storage("Write export file")?;

        Ok(ArtifactHandle { key })
    }

    async fn presign(&self, handle: &ArtifactHandle, _ttl_secs: u32) -> Result<String, AppError> {
        // Local files are served by /media without expiry
        Ok(format!("{}/media/{}", self.public_base_url, handle.key))
    }

    async fn delete(&self, handle: &ArtifactHandle) -> Result<(), AppError> {
        tokio::fs::remove_file(self.root.join(&handle.key))
            .await
            .storage("Remove export file")
    }
}
