//! Durable photo storage.
//!
//! `BlobStore` is the narrow blob-store interface (write bytes at a path,
//! mark public, map a path to its public URL). `FsBlobStore` backs it with a
//! directory tree served by whatever fronts `public_base_url`. `PhotoWriter`
//! derives the object path for a `(location, index)` slot and performs the
//! three-step write.
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::model::is_valid_location_id;

const PHOTO_PREFIX: &str = "location-photos";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("invalid object path: {0}")]
    InvalidPath(String),
}

/// Per-object metadata kept next to the bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_type: String,
    pub cache_control: String,
    #[serde(default)]
    pub public: bool,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write (or overwrite) the object at `path`.
    async fn put(&self, path: &str, bytes: Bytes, meta: &ObjectMeta) -> Result<(), StorageError>;
    async fn make_public(&self, path: &str) -> Result<(), StorageError>;
    fn public_url(&self, path: &str) -> String;
}

/// File-backed blob store. Each object is `{root}/{path}` plus a
/// `{root}/{path}.meta.json` sidecar; both are replaced via tmp + rename.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: PathBuf, public_base_url: &str) -> Self {
        Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn object_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let valid = !path.is_empty()
            && path
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
        if !valid {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn meta_path(object: &Path) -> PathBuf {
        let mut name = object.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    pub async fn read_meta(&self, path: &str) -> Result<ObjectMeta, StorageError> {
        let object = self.object_path(path)?;
        let raw = tokio::fs::read(Self::meta_path(&object))
            .await
            .map_err(|err| unavailable("read object metadata", &object, err))?;
        serde_json::from_slice(&raw).map_err(|err| {
            StorageError::StorageUnavailable(format!("corrupt metadata for {path}: {err}"))
        })
    }

    async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(target.display().to_string()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| unavailable("create object dir", parent, err))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{file_name}.tmp-{}", Uuid::new_v4().simple()));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|err| unavailable("create temp object", &tmp, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| unavailable("write temp object", &tmp, err))?;
        file.flush()
            .await
            .map_err(|err| unavailable("flush temp object", &tmp, err))?;
        drop(file);

        if let Err(err) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(unavailable("move object into place", target, err));
        }
        Ok(())
    }
}

fn unavailable(op: &str, path: &Path, err: std::io::Error) -> StorageError {
    StorageError::StorageUnavailable(format!("failed to {op} {}: {err}", path.display()))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Bytes, meta: &ObjectMeta) -> Result<(), StorageError> {
        let object = self.object_path(path)?;
        let meta_json = serde_json::to_vec(meta)
            .map_err(|err| StorageError::StorageUnavailable(err.to_string()))?;
        Self::write_atomic(&object, &bytes).await?;
        Self::write_atomic(&Self::meta_path(&object), &meta_json).await
    }

    async fn make_public(&self, path: &str) -> Result<(), StorageError> {
        let mut meta = self.read_meta(path).await?;
        if meta.public {
            return Ok(());
        }
        meta.public = true;
        let object = self.object_path(path)?;
        let meta_json = serde_json::to_vec(&meta)
            .map_err(|err| StorageError::StorageUnavailable(err.to_string()))?;
        Self::write_atomic(&Self::meta_path(&object), &meta_json).await
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path)
    }
}

/// Writes validated photo bytes to their durable slot.
#[derive(Clone)]
pub struct PhotoWriter {
    store: Arc<dyn BlobStore>,
    cache_control: String,
}

impl PhotoWriter {
    pub fn new(store: Arc<dyn BlobStore>, cache_control: impl Into<String>) -> Self {
        Self {
            store,
            cache_control: cache_control.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let store = FsBlobStore::new(PathBuf::from(&cfg.storage.root), &cfg.storage.public_base_url);
        Self::new(Arc::new(store), cfg.storage.cache_control.clone())
    }

    /// Object path for a photo slot. Depends only on `(location, index)` so a
    /// re-ingest overwrites the slot whatever the new content type is; the
    /// type itself lives in the object metadata.
    pub fn object_path(location_id: &str, index: usize) -> Result<String, StorageError> {
        if !is_valid_location_id(location_id) {
            return Err(StorageError::InvalidPath(format!(
                "unsafe location id {location_id:?}"
            )));
        }
        Ok(format!("{PHOTO_PREFIX}/{location_id}/photo_{index}"))
    }

    /// Write, publish and return the durable URL of one photo.
    #[instrument(skip_all, fields(location_id = %location_id, index))]
    pub async fn store(
        &self,
        location_id: &str,
        index: usize,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let path = Self::object_path(location_id, index)?;
        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            cache_control: self.cache_control.clone(),
            public: false,
        };
        let size = bytes.len();
        self.store.put(&path, bytes, &meta).await?;
        self.store.make_public(&path).await?;
        let url = self.store.public_url(&path);
        debug!(%path, size, "photo stored");
        Ok(url)
    }
}
