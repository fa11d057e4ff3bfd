//! Artifact storage backend (spec §6 `ObjectStoreAdapter`).
//!
//! `LocalObjectStore` is the default/test implementor, grounded in the
//! teacher's `FactoryDb::new_in_memory()` test-double convention — a
//! filesystem directory stands in for a bucket so tests never need
//! network access. `S3ObjectStore`, behind the `s3` feature, is the
//! production implementor via `aws-sdk-s3`, the crate the rest of this
//! retrieval pack reaches for at this exact interface shape.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Metadata about a stored object, returned by `get_info`.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    async fn upload(
        &self,
        key: &str,
        content: Vec<u8>,
        content_type: &str,
        metadata: Vec<(String, String)>,
    ) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn get_signed_url(&self, key: &str, expires_in: std::time::Duration) -> Result<String>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn get_info(&self, key: &str) -> Result<Option<ObjectInfo>>;
}

/// Filesystem-backed store rooted at `root_dir`. Keys map to relative
/// paths under the root; a sibling `.meta.json` file carries content type
/// and custom metadata since the local filesystem has no such concept.
pub struct LocalObjectStore {
    root_dir: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LocalMeta {
    content_type: String,
    metadata: Vec<(String, String)>,
}

impl LocalObjectStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let mut path = self.root_dir.join(key);
        path.set_extension(match path.extension() {
            Some(ext) => format!("{}.meta.json", ext.to_string_lossy()),
            None => "meta.json".to_string(),
        });
        path
    }
}

#[async_trait]
impl ObjectStoreAdapter for LocalObjectStore {
    async fn upload(
        &self,
        key: &str,
        content: Vec<u8>,
        content_type: &str,
        metadata: Vec<(String, String)>,
    ) -> Result<()> {
        let object_path = self.object_path(key);
        if let Some(parent) = object_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory for {}", object_path.display()))?;
        }
        tokio::fs::write(&object_path, &content)
            .await
            .with_context(|| format!("failed to write object {}", object_path.display()))?;

        let meta = LocalMeta {
            content_type: content_type.to_string(),
            metadata,
        };
        let meta_json = serde_json::to_vec_pretty(&meta).context("failed to serialize object metadata")?;
        tokio::fs::write(self.meta_path(key), meta_json)
            .await
            .context("failed to write object metadata")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let object_path = self.object_path(key);
        if object_path.exists() {
            tokio::fs::remove_file(&object_path)
                .await
                .with_context(|| format!("failed to delete object {}", object_path.display()))?;
        }
        let meta_path = self.meta_path(key);
        if meta_path.exists() {
            let _ = tokio::fs::remove_file(&meta_path).await;
        }
        Ok(())
    }

    async fn get_signed_url(&self, key: &str, _expires_in: std::time::Duration) -> Result<String> {
        // No real signing scheme for the filesystem backend; callers in
        // tests/dev redirect straight at a local static-file route.
        Ok(format!("file://{}", self.object_path(key).display()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key).exists())
    }

    async fn get_info(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let object_path = self.object_path(key);
        if !object_path.exists() {
            return Ok(None);
        }
        let metadata = tokio::fs::metadata(&object_path)
            .await
            .with_context(|| format!("failed to stat {}", object_path.display()))?;
        let content_type = match tokio::fs::read(self.meta_path(key)).await {
            Ok(bytes) => serde_json::from_slice::<LocalMeta>(&bytes)
                .map(|m| m.content_type)
                .unwrap_or_else(|_| "application/octet-stream".to_string()),
            Err(_) => "application/octet-stream".to_string(),
        };
        let last_modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size_bytes: metadata.len(),
            content_type,
            last_modified,
        }))
    }
}

#[cfg(feature = "s3")]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

#[cfg(feature = "s3")]
impl S3ObjectStore {
    pub async fn new(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        }
    }
}

#[cfg(feature = "s3")]
#[async_trait]
impl ObjectStoreAdapter for S3ObjectStore {
    async fn upload(
        &self,
        key: &str,
        content: Vec<u8>,
        content_type: &str,
        metadata: Vec<(String, String)>,
    ) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type(content_type);
        for (k, v) in metadata {
            request = request.metadata(k, v);
        }
        request.send().await.context("failed to upload object to S3")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("failed to delete object from S3")?;
        Ok(())
    }

    async fn get_signed_url(&self, key: &str, expires_in: std::time::Duration) -> Result<String> {
        let presign_config = aws_sdk_s3::presigning::PresigningConfig::expires_in(expires_in)
            .context("invalid presign expiry")?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .context("failed to presign object URL")?;
        Ok(presigned.uri().to_string())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(aws_sdk_s3::error::SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(false),
            Err(err) => Err(err).context("failed to head object in S3"),
        }
    }

    async fn get_info(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let response = match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(aws_sdk_s3::error::SdkError::ServiceError(err)) if err.err().is_not_found() => {
                return Ok(None);
            }
            Err(err) => return Err(err).context("failed to head object in S3"),
        };

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size_bytes: response.content_length().unwrap_or(0) as u64,
            content_type: response.content_type().unwrap_or("application/octet-stream").to_string(),
            last_modified: response
                .last_modified()
                .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
                .unwrap_or_else(Utc::now),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_exists_and_get_info() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .upload(
                "builds/abc/artifacts.zip",
                b"zip-bytes".to_vec(),
                "application/zip",
                vec![("buildId".to_string(), "abc".to_string())],
            )
            .await
            .unwrap();

        assert!(store.exists("builds/abc/artifacts.zip").await.unwrap());
        let info = store.get_info("builds/abc/artifacts.zip").await.unwrap().unwrap();
        assert_eq!(info.content_type, "application/zip");
        assert_eq!(info.size_bytes, 9);
    }

    #[tokio::test]
    async fn get_info_returns_none_for_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store.get_info("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_object_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store
            .upload("key.txt", b"hi".to_vec(), "text/plain", vec![])
            .await
            .unwrap();
        store.delete("key.txt").await.unwrap();
        assert!(!store.exists("key.txt").await.unwrap());
    }

    #[tokio::test]
    async fn signed_url_points_at_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.upload("a/b.zip", b"x".to_vec(), "application/zip", vec![]).await.unwrap();
        let url = store.get_signed_url("a/b.zip", std::time::Duration::from_secs(60)).await.unwrap();
        assert!(url.starts_with("file://"));
    }
}
