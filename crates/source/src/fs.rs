//! Filesystem blob store. Keys map to relative paths under a root directory;
//! the MIME type rides in a sidecar file next to the payload.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::fs;

use crate::BlobStore;

const DEFAULT_MIME: &str = "application/octet-stream";

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("blob key '{key}' must be a plain relative path"),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create blob directory for key '{key}'"))?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write blob '{key}'"))?;
        fs::write(path.with_extension("mime"), mime_type.as_bytes())
            .await
            .with_context(|| format!("failed to write mime sidecar for '{key}'"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, String)>> {
        let path = self.resolve(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read blob '{key}'"));
            }
        };
        let mime = fs::read_to_string(path.with_extension("mime"))
            .await
            .unwrap_or_else(|_| DEFAULT_MIME.to_string());
        Ok(Some((bytes, mime)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_blob_with_mime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        store
            .put("channel/42/101-1.jpg", b"bytes", "image/jpeg")
            .await
            .expect("put");

        let (bytes, mime) = store
            .get("channel/42/101-1.jpg")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(bytes, b"bytes");
        assert_eq!(mime, "image/jpeg");
    }

    #[tokio::test]
    async fn missing_key_is_none_and_traversal_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        assert!(store.get("channel/1/none.jpg").await.expect("get").is_none());
        assert!(store.get("../escape").await.is_err());
    }
}
