//! Object store gateway — content-addressed storage for run artifacts
//! (screenshots, scrape payloads too large to inline in the record store).
//!
//! Out of scope per the spec: the real object store's own internals. This
//! is a thin, real local-disk adapter behind the same named port a
//! production deployment would put an S3-compatible client behind.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("io error writing object: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, run_id: &str, artifact_key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn put(&self, run_id: &str, artifact_key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
        (**self).put(run_id, artifact_key, bytes).await
    }
}

/// Writes objects under `root/<sha256-hex>` and returns a `file://` URI
/// whose path embeds the content hash, so repeated `put`s of identical
/// bytes are free and URIs double as integrity checks.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn content_key(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, run_id: &str, artifact_key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
        let hash = Self::content_key(&bytes);
        let dir = self.root.join(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = format!("{hash}-{artifact_key}");
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &bytes).await?;
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeObjectStore {
        pub puts: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn put(&self, run_id: &str, artifact_key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
            let len = bytes.len();
            self.puts
                .lock()
                .unwrap()
                .push((run_id.to_string(), artifact_key.to_string(), len));
            Ok(format!("fake://{run_id}/{artifact_key}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_returns_content_addressed_uri() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let uri = store
            .put("run-1", "screenshot.png", b"hello".to_vec())
            .await
            .unwrap();
        // sha256("hello") = 2cf24dba5fb0a...
        assert!(uri.contains("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"));
        assert!(uri.ends_with("screenshot.png"));
    }

    #[tokio::test]
    async fn identical_bytes_hash_identically() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let a = store.put("run-1", "a.json", b"same".to_vec()).await.unwrap();
        let b = store.put("run-2", "b.json", b"same".to_vec()).await.unwrap();
        let hash_of = |uri: &str| uri.split('/').next_back().unwrap().split('-').next().unwrap().to_string();
        assert_eq!(hash_of(&a), hash_of(&b));
    }
}
