//! Storage provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use stowage_common::{BlobId, Result, StorageError};

use crate::normalize;

/// Content type used when the caller does not provide one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Maximum lifetime of an access URL (7 days, the V4 signing limit).
pub const MAX_ACCESS_URL_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Readable blob content returned by [`StorageProvider::fetch`].
///
/// The caller owns the reader and releases the underlying connection or
/// file handle by dropping it.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Visibility of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobSecurity {
    /// Readable only with credentials or an access URL.
    #[default]
    Private,
    /// Readable by anyone through [`StorageProvider::blob_url`].
    Public,
}

/// Properties applied when saving or updating a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobProperties {
    /// MIME type; [`DEFAULT_CONTENT_TYPE`] when absent.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Requested visibility.
    #[serde(default)]
    pub security: BlobSecurity,
    /// User-defined metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BlobProperties {
    /// Private blob with the given content type.
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }

    /// Mark the blob as publicly readable.
    pub fn public(mut self) -> Self {
        self.security = BlobSecurity::Public;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether public visibility was requested.
    pub fn is_public(&self) -> bool {
        self.security == BlobSecurity::Public
    }

    /// Effective content type.
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// Snapshot of a stored blob's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobDescriptor {
    /// Identifier of the blob.
    pub id: BlobId,
    /// Size in bytes.
    pub length: u64,
    /// MIME type.
    pub content_type: String,
    /// ETag or revision for change detection.
    pub etag: Option<String>,
    /// Base64 MD5 of the content, when the backend provides one.
    pub content_md5: Option<String>,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
    /// Visibility.
    pub security: BlobSecurity,
    /// User-defined metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Capability granted by an access URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlAccess {
    /// Download the blob.
    Read,
    /// Upload (overwrite) the blob.
    Write,
}

impl UrlAccess {
    /// HTTP method the URL is valid for.
    pub fn http_method(self) -> &'static str {
        match self {
            UrlAccess::Read => "GET",
            UrlAccess::Write => "PUT",
        }
    }
}

/// Options for [`StorageProvider::generate_access_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUrlOptions {
    /// How long the URL stays valid.
    pub expires_in: Duration,
    /// Granted capability.
    pub access: UrlAccess,
    /// Content type the response (read) or request (write) must carry.
    pub content_type: Option<String>,
    /// File name suggested to browsers on download.
    pub download_name: Option<String>,
}

impl AccessUrlOptions {
    /// Read access for the given duration.
    pub fn read(expires_in: Duration) -> Self {
        Self {
            expires_in,
            access: UrlAccess::Read,
            content_type: None,
            download_name: None,
        }
    }

    /// Write access for the given duration.
    pub fn write(expires_in: Duration) -> Self {
        Self {
            access: UrlAccess::Write,
            ..Self::read(expires_in)
        }
    }

    /// Suggest a download file name.
    pub fn with_download_name(mut self, name: impl Into<String>) -> Self {
        self.download_name = Some(name.into());
        self
    }

    /// Pin the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Reject zero or over-long access URL lifetimes.
pub fn validate_expiry(expires_in: Duration) -> Result<()> {
    if expires_in.is_zero() {
        Err(StorageError::generic(
            "Access URL expiry must be greater than zero",
        ))
    } else if expires_in > MAX_ACCESS_URL_EXPIRY {
        Err(StorageError::generic(format!(
            "Access URL expiry {:?} exceeds maximum allowed {:?}",
            expires_in, MAX_ACCESS_URL_EXPIRY
        )))
    } else {
        Ok(())
    }
}

/// Storage provider trait for different backends.
///
/// Every failure is reported as a [`StorageError`] carrying a normalized
/// [`ErrorCode`](stowage_common::ErrorCode). A provider built from an
/// unusable configuration fails every operation with `GenericException`.
/// Implementations hold no per-call state and may be shared freely.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g., "gcs", "local", "memory").
    fn name(&self) -> &str;

    /// Upload content to a blob, replacing any existing content.
    ///
    /// The reader stays owned by the caller and is read to its end.
    /// If `properties` requests public visibility and it cannot be applied,
    /// the call fails even when the upload itself succeeded.
    async fn save(
        &self,
        id: &BlobId,
        content: &mut (dyn AsyncRead + Send + Unpin),
        properties: &BlobProperties,
    ) -> Result<()>;

    /// Upload an in-memory buffer.
    async fn save_bytes(
        &self,
        id: &BlobId,
        data: Vec<u8>,
        properties: &BlobProperties,
    ) -> Result<()> {
        let mut cursor = Cursor::new(data);
        self.save(id, &mut cursor, properties).await
    }

    /// Open a blob for reading.
    ///
    /// # Errors
    /// - `NotFound` if the blob does not exist
    async fn fetch(&self, id: &BlobId) -> Result<BlobReader>;

    /// Read a whole blob into memory.
    async fn fetch_bytes(&self, id: &BlobId) -> Result<Vec<u8>> {
        let mut reader = self.fetch(id).await?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(normalize::from_io)?;
        Ok(data)
    }

    /// Delete a blob.
    ///
    /// # Errors
    /// - `NotFound` if the blob does not exist
    async fn delete(&self, id: &BlobId) -> Result<()>;

    /// Copy a blob, overwriting the destination.
    ///
    /// # Errors
    /// - `NotFound` if the source does not exist
    async fn copy(&self, source: &BlobId, dest: &BlobId) -> Result<()>;

    /// Copy then delete the source.
    async fn move_blob(&self, source: &BlobId, dest: &BlobId) -> Result<()> {
        self.copy(source, dest).await?;
        self.delete(source).await
    }

    /// Produce a time-limited URL granting read or write access to one blob.
    async fn generate_access_url(&self, id: &BlobId, options: &AccessUrlOptions)
        -> Result<String>;

    /// Get metadata for a blob.
    async fn descriptor(&self, id: &BlobId) -> Result<BlobDescriptor>;

    /// List every blob in a container, sorted by key.
    ///
    /// An empty or unknown container yields an empty list.
    async fn list(&self, container: &str) -> Result<Vec<BlobDescriptor>>;

    /// Delete every blob in a container.
    async fn delete_container(&self, container: &str) -> Result<()>;

    /// Replace content type, metadata and visibility of an existing blob.
    async fn update_properties(&self, id: &BlobId, properties: &BlobProperties) -> Result<()>;

    /// Plain URL of a blob, readable without credentials once it is public.
    ///
    /// This only formats an address; it does not check that the blob exists.
    fn blob_url(&self, id: &BlobId) -> Result<String>;
}
