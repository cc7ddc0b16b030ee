//! Local filesystem storage provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncRead;
use url::Url;
use uuid::Uuid;

use stowage_common::{validate_container, BlobId, Result, StorageError};

use crate::encoding::{decode_component, encode_component};
use crate::normalize;
use crate::provider::{
    validate_expiry, AccessUrlOptions, BlobDescriptor, BlobProperties, BlobReader,
    StorageProvider,
};

/// Directory under the root holding blob content.
const BLOBS_DIR: &str = "blobs";
/// Directory under the root holding property sidecars.
const META_DIR: &str = "meta";
/// Directory under the root holding in-flight writes.
const TEMP_DIR: &str = "tmp";
/// Suffix of in-flight writes.
const TEMP_SUFFIX: &str = ".partial";

/// Local provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalOptions {
    /// Root directory of the store.
    pub root: PathBuf,
}

/// Local filesystem storage provider.
///
/// Containers are directories. Each key is stored as a single file named
/// by its percent-encoded form, so `docs/a` and `docs/a/b` are independent
/// files rather than a file and a directory. Content lives under
/// `<root>/blobs`, properties in JSON sidecars under `<root>/meta`.
///
/// Writes are staged in `<root>/tmp` and renamed into place, so readers
/// never observe a partially written blob. Content is committed before its
/// sidecar; a crash between the two renames leaves the new content with
/// the previous properties.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Create a new local provider with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - The root cannot be created or resolved
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();

        if !root.exists() {
            std::fs::create_dir_all(root).map_err(normalize::from_io)?;
        }

        // Absolute root so file URLs can be built from it.
        let root = std::fs::canonicalize(root).map_err(normalize::from_io)?;

        Ok(Self { root })
    }

    /// Create from options.
    pub fn from_options(options: &LocalOptions) -> Result<Self> {
        Self::new(&options.root)
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, base: &str, container: &str) -> PathBuf {
        self.root.join(base).join(container)
    }

    /// Filesystem path of a blob's content.
    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.container_dir(BLOBS_DIR, id.container())
            .join(encode_component(id.key()))
    }

    /// Filesystem path of a blob's property sidecar.
    fn meta_path(&self, id: &BlobId) -> PathBuf {
        self.container_dir(META_DIR, id.container())
            .join(format!("{}.json", encode_component(id.key())))
    }

    /// Fresh staging path on the same filesystem as the store.
    async fn temp_path(&self) -> Result<PathBuf> {
        let dir = self.root.join(TEMP_DIR);
        fs::create_dir_all(&dir).await.map_err(normalize::from_io)?;
        Ok(dir.join(format!("{}{}", Uuid::new_v4().simple(), TEMP_SUFFIX)))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(normalize::from_io)?;
        }
        Ok(())
    }

    async fn discard(temp: &Path) {
        match fs::remove_file(temp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %temp.display(), error = %e, "Failed to remove staged file")
            }
        }
    }

    async fn write_file(
        path: &Path,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> std::io::Result<()> {
        let mut file = fs::File::create(path).await?;
        tokio::io::copy(content, &mut file).await?;
        file.sync_all().await
    }

    /// Write `content` to a new staging file, removing it on failure.
    async fn stage_content(
        &self,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PathBuf> {
        let temp = self.temp_path().await?;
        match Self::write_file(&temp, content).await {
            Ok(()) => Ok(temp),
            Err(e) => {
                Self::discard(&temp).await;
                Err(normalize::from_io(e))
            }
        }
    }

    async fn stage_copy(&self, source: &Path) -> Result<PathBuf> {
        let temp = self.temp_path().await?;
        match fs::copy(source, &temp).await {
            Ok(_) => Ok(temp),
            Err(e) => {
                Self::discard(&temp).await;
                Err(normalize::from_io(e))
            }
        }
    }

    async fn stage_properties(&self, properties: &BlobProperties) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(properties)
            .map_err(|e| normalize::from_json(e, "Failed to serialize properties"))?;

        let temp = self.temp_path().await?;
        match fs::write(&temp, json).await {
            Ok(()) => Ok(temp),
            Err(e) => {
                Self::discard(&temp).await;
                Err(normalize::from_io(e))
            }
        }
    }

    /// Rename a staged file into place, removing it if the rename fails.
    async fn commit(temp: &Path, path: &Path) -> Result<()> {
        if let Err(e) = fs::rename(temp, path).await {
            Self::discard(temp).await;
            return Err(normalize::from_io(e));
        }
        Ok(())
    }

    /// Move staged content and properties into place for `id`.
    async fn commit_blob(
        &self,
        id: &BlobId,
        content: PathBuf,
        properties: &BlobProperties,
    ) -> Result<()> {
        let meta_temp = match self.stage_properties(properties).await {
            Ok(temp) => temp,
            Err(e) => {
                Self::discard(&content).await;
                return Err(e);
            }
        };

        let path = self.blob_path(id);
        let meta = self.meta_path(id);
        let prepared = match Self::ensure_parent(&path).await {
            Ok(()) => Self::ensure_parent(&meta).await,
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            Self::discard(&content).await;
            Self::discard(&meta_temp).await;
            return Err(e);
        }

        if let Err(e) = Self::commit(&content, &path).await {
            Self::discard(&meta_temp).await;
            return Err(e);
        }
        Self::commit(&meta_temp, &meta).await
    }

    async fn require_blob(&self, id: &BlobId) -> Result<PathBuf> {
        let path = self.blob_path(id);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(StorageError::not_found(format!("Blob not found: {}", id))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(format!("Blob not found: {}", id)))
            }
            Err(e) => Err(normalize::from_io(e)),
        }
    }

    async fn read_properties(&self, id: &BlobId) -> Result<BlobProperties> {
        match fs::read(self.meta_path(id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| normalize::from_json(e, "Corrupt property sidecar")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlobProperties::default()),
            Err(e) => Err(normalize::from_io(e)),
        }
    }

    async fn write_properties(&self, id: &BlobId, properties: &BlobProperties) -> Result<()> {
        let path = self.meta_path(id);
        Self::ensure_parent(&path).await?;
        let temp = self.stage_properties(properties).await?;
        Self::commit(&temp, &path).await
    }

    async fn remove_properties(&self, id: &BlobId) -> Result<()> {
        match fs::remove_file(self.meta_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(normalize::from_io(e)),
        }
    }

    /// Create a descriptor from filesystem metadata.
    fn create_descriptor(
        id: &BlobId,
        fs_meta: &std::fs::Metadata,
        properties: BlobProperties,
    ) -> BlobDescriptor {
        let modified: DateTime<Utc> = fs_meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());

        BlobDescriptor {
            id: id.clone(),
            length: fs_meta.len(),
            content_type: properties.content_type_or_default().to_string(),
            etag: Some(format!(
                "{}-{}",
                modified.timestamp_nanos_opt().unwrap_or_default(),
                fs_meta.len()
            )),
            content_md5: None,
            last_modified: modified,
            security: properties.security,
            metadata: properties.metadata,
        }
    }

    /// Ids of every blob file directly inside a container directory.
    ///
    /// Files whose names are not the encoding of a valid key were not
    /// written by this provider and are skipped.
    async fn container_ids(&self, container: &str) -> Result<Vec<BlobId>> {
        let dir = self.container_dir(BLOBS_DIR, container);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(normalize::from_io(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(normalize::from_io)? {
            if !entry.file_type().await.map_err(normalize::from_io)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match decode_component(&name).map(|key| BlobId::new(container, key)) {
                Some(Ok(id)) => ids.push(id),
                _ => tracing::debug!(container, file = %name, "Skipping foreign file"),
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn save(
        &self,
        id: &BlobId,
        content: &mut (dyn AsyncRead + Send + Unpin),
        properties: &BlobProperties,
    ) -> Result<()> {
        let staged = self.stage_content(content).await?;
        self.commit_blob(id, staged, properties).await?;

        tracing::debug!(blob = %id, path = %self.blob_path(id).display(), "Saved local blob");
        Ok(())
    }

    async fn fetch(&self, id: &BlobId) -> Result<BlobReader> {
        let path = self.require_blob(id).await?;
        let file = fs::File::open(&path).await.map_err(normalize::from_io)?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, id: &BlobId) -> Result<()> {
        let path = self.require_blob(id).await?;
        fs::remove_file(&path).await.map_err(normalize::from_io)?;
        self.remove_properties(id).await
    }

    async fn copy(&self, source: &BlobId, dest: &BlobId) -> Result<()> {
        let source_path = self.require_blob(source).await?;
        let properties = self.read_properties(source).await?;

        let staged = self.stage_copy(&source_path).await?;
        self.commit_blob(dest, staged, &properties).await
    }

    /// Filesystems have no capability tokens: the URL is a plain `file://`
    /// URL and the expiry is only validated, not enforced.
    async fn generate_access_url(
        &self,
        id: &BlobId,
        options: &AccessUrlOptions,
    ) -> Result<String> {
        validate_expiry(options.expires_in)?;
        self.blob_url(id)
    }

    async fn descriptor(&self, id: &BlobId) -> Result<BlobDescriptor> {
        let path = self.require_blob(id).await?;
        let fs_meta = fs::metadata(&path).await.map_err(normalize::from_io)?;
        let properties = self.read_properties(id).await?;
        Ok(Self::create_descriptor(id, &fs_meta, properties))
    }

    async fn list(&self, container: &str) -> Result<Vec<BlobDescriptor>> {
        validate_container(container)?;

        let mut results = Vec::new();
        for id in self.container_ids(container).await? {
            results.push(self.descriptor(&id).await?);
        }

        Ok(results)
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        validate_container(container)?;

        for base in [BLOBS_DIR, META_DIR] {
            match fs::remove_dir_all(self.container_dir(base, container)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(normalize::from_io(e)),
            }
        }

        Ok(())
    }

    async fn update_properties(&self, id: &BlobId, properties: &BlobProperties) -> Result<()> {
        self.require_blob(id).await?;

        let mut updated = properties.clone();
        if updated.content_type.is_none() {
            updated.content_type = self.read_properties(id).await?.content_type;
        }
        self.write_properties(id, &updated).await
    }

    fn blob_url(&self, id: &BlobId) -> Result<String> {
        Url::from_file_path(self.blob_path(id))
            .map(|url| url.to_string())
            .map_err(|_| StorageError::generic(format!("Cannot build file URL for {}", id)))
    }
}
