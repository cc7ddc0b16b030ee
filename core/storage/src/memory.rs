//! In-memory storage provider for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use stowage_common::{validate_container, BlobId, Result, StorageError};

use crate::encoding::{encode_component, encode_path};
use crate::normalize;
use crate::provider::{
    validate_expiry, AccessUrlOptions, BlobDescriptor, BlobProperties, BlobReader, BlobSecurity,
    StorageProvider, UrlAccess,
};
use crate::testing::RawSeeder;

/// In-memory storage entry.
#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    descriptor: BlobDescriptor,
}

type Blobs = BTreeMap<BlobId, Entry>;

/// In-memory storage provider.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    storage: Arc<RwLock<Blobs>>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Blobs>> {
        self.storage
            .read()
            .map_err(|_| StorageError::generic("Memory storage lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Blobs>> {
        self.storage
            .write()
            .map_err(|_| StorageError::generic("Memory storage lock poisoned"))
    }

    fn new_descriptor(id: &BlobId, length: usize, properties: &BlobProperties) -> BlobDescriptor {
        BlobDescriptor {
            id: id.clone(),
            length: length as u64,
            content_type: properties.content_type_or_default().to_string(),
            etag: Some(Uuid::new_v4().to_string()),
            content_md5: None,
            last_modified: Utc::now(),
            security: properties.security,
            metadata: properties.metadata.clone(),
        }
    }

    fn insert(&self, id: &BlobId, data: Vec<u8>, properties: &BlobProperties) -> Result<()> {
        let entry = Entry {
            descriptor: Self::new_descriptor(id, data.len(), properties),
            data: Bytes::from(data),
        };
        self.write()?.insert(id.clone(), entry);
        Ok(())
    }

    fn not_found(id: &BlobId) -> StorageError {
        StorageError::not_found(format!("Blob not found: {}", id))
    }

    /// Number of stored blobs across all containers.
    pub fn len(&self) -> usize {
        self.read().map(|blobs| blobs.len()).unwrap_or(0)
    }

    /// Check if no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(
        &self,
        id: &BlobId,
        content: &mut (dyn AsyncRead + Send + Unpin),
        properties: &BlobProperties,
    ) -> Result<()> {
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .await
            .map_err(normalize::from_io)?;

        self.insert(id, data, properties)
    }

    async fn fetch(&self, id: &BlobId) -> Result<BlobReader> {
        let data = self
            .read()?
            .get(id)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| Self::not_found(id))?;

        // Snapshot: later writes to the same id do not affect this reader.
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, id: &BlobId) -> Result<()> {
        match self.write()?.remove(id) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(id)),
        }
    }

    async fn copy(&self, source: &BlobId, dest: &BlobId) -> Result<()> {
        let mut storage = self.write()?;

        let entry = storage
            .get(source)
            .cloned()
            .ok_or_else(|| Self::not_found(source))?;

        let mut descriptor = entry.descriptor;
        descriptor.id = dest.clone();
        descriptor.etag = Some(Uuid::new_v4().to_string());
        descriptor.last_modified = Utc::now();

        storage.insert(
            dest.clone(),
            Entry {
                data: entry.data,
                descriptor,
            },
        );

        Ok(())
    }

    async fn generate_access_url(
        &self,
        id: &BlobId,
        options: &AccessUrlOptions,
    ) -> Result<String> {
        validate_expiry(options.expires_in)?;

        let expires = Utc::now().timestamp() + options.expires_in.as_secs() as i64;
        let access = match options.access {
            UrlAccess::Read => "read",
            UrlAccess::Write => "write",
        };

        let mut url = format!(
            "{}?access={}&expires={}",
            self.blob_url(id)?,
            access,
            expires
        );
        if let Some(name) = &options.download_name {
            url.push_str(&format!("&filename={}", encode_component(name)));
        }
        Ok(url)
    }

    async fn descriptor(&self, id: &BlobId) -> Result<BlobDescriptor> {
        self.read()?
            .get(id)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn list(&self, container: &str) -> Result<Vec<BlobDescriptor>> {
        validate_container(container)?;

        // BTreeMap order is (container, key), so results come out sorted.
        Ok(self
            .read()?
            .iter()
            .filter(|(id, _)| id.container() == container)
            .map(|(_, entry)| entry.descriptor.clone())
            .collect())
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        validate_container(container)?;
        self.write()?.retain(|id, _| id.container() != container);
        Ok(())
    }

    async fn update_properties(&self, id: &BlobId, properties: &BlobProperties) -> Result<()> {
        let mut storage = self.write()?;
        let entry = storage.get_mut(id).ok_or_else(|| Self::not_found(id))?;

        let descriptor = &mut entry.descriptor;
        if let Some(content_type) = &properties.content_type {
            descriptor.content_type = content_type.clone();
        }
        descriptor.security = properties.security;
        descriptor.metadata = properties.metadata.clone();
        descriptor.etag = Some(Uuid::new_v4().to_string());
        descriptor.last_modified = Utc::now();

        Ok(())
    }

    fn blob_url(&self, id: &BlobId) -> Result<String> {
        Ok(format!(
            "memory://{}/{}",
            encode_component(id.container()),
            encode_path(id.key())
        ))
    }
}

#[async_trait]
impl RawSeeder for MemoryProvider {
    async fn seed_object(
        &self,
        id: &BlobId,
        data: Vec<u8>,
        content_type: Option<&str>,
        public: bool,
    ) -> Result<()> {
        let properties = BlobProperties {
            content_type: content_type.map(str::to_string),
            security: if public {
                BlobSecurity::Public
            } else {
                BlobSecurity::Private
            },
            metadata: BTreeMap::new(),
        };
        self.insert(id, data, &properties)
    }
}
