//! Google Cloud Storage provider implementation.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use stowage_common::{validate_container, BlobId, ErrorCode, Result, SecretString, StorageError};

use crate::encoding::{encode_component, encode_path};
use crate::normalize;
use crate::provider::{
    validate_expiry, AccessUrlOptions, BlobDescriptor, BlobProperties, BlobReader, BlobSecurity,
    StorageProvider, DEFAULT_CONTENT_TYPE,
};

use super::auth::{TokenManager, GOOGLE_TOKEN_URL};
use super::client::{
    GcsClient, GcsObject, ObjectFields, GCS_API_BASE, GCS_UPLOAD_BASE, PUBLIC_ENTITY,
    PUBLIC_READ_ACL, READER_ROLE,
};
use super::signing::{sign_url, SignedUrlRequest};

/// Host serving public objects and signed URLs.
pub const GCS_SIGNING_ENDPOINT: &str = "https://storage.googleapis.com";

/// Environment variable holding the service-account email.
pub const ENV_EMAIL: &str = "STOWAGE_GCS_EMAIL";
/// Environment variable holding the PEM private key.
pub const ENV_PRIVATE_KEY: &str = "STOWAGE_GCS_PRIVATE_KEY";
/// Environment variable holding the bucket name.
pub const ENV_BUCKET: &str = "STOWAGE_GCS_BUCKET";

/// How public visibility is applied on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicAclMode {
    /// Upload with `predefinedAcl=publicRead`; never leaves a private copy behind.
    #[default]
    Predefined,
    /// Upload privately, then add an `allUsers` reader entry.
    FollowUp,
}

/// Google Cloud Storage provider configuration.
///
/// Credentials may be absent. The provider is still created, and every
/// operation then fails with `GenericException`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsOptions {
    /// Service-account email.
    #[serde(default)]
    pub email: Option<String>,
    /// PEM-encoded service-account private key.
    #[serde(default)]
    pub private_key: Option<SecretString>,
    /// Bucket holding all containers.
    pub bucket: String,
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    #[serde(default = "default_upload_endpoint")]
    pub upload_endpoint: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_signing_endpoint")]
    pub signing_endpoint: String,
    #[serde(default)]
    pub public_acl_mode: PublicAclMode,
}

fn default_api_endpoint() -> String {
    GCS_API_BASE.to_string()
}

fn default_upload_endpoint() -> String {
    GCS_UPLOAD_BASE.to_string()
}

fn default_token_endpoint() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

fn default_signing_endpoint() -> String {
    GCS_SIGNING_ENDPOINT.to_string()
}

/// Fields read from a downloaded service-account key file.
#[derive(Deserialize)]
struct ServiceAccountKeyFile {
    client_email: String,
    private_key: SecretString,
}

impl GcsOptions {
    /// Options with the default Google endpoints.
    pub fn new(
        email: Option<String>,
        private_key: Option<SecretString>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            email,
            private_key,
            bucket: bucket.into(),
            api_endpoint: default_api_endpoint(),
            upload_endpoint: default_upload_endpoint(),
            token_endpoint: default_token_endpoint(),
            signing_endpoint: default_signing_endpoint(),
            public_acl_mode: PublicAclMode::default(),
        }
    }

    /// Load credentials from a service-account JSON key file.
    pub fn from_service_account_file(
        path: impl AsRef<Path>,
        bucket: impl Into<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StorageError::generic(format!(
                "Failed to read service account file {}: {}",
                path.display(),
                e
            ))
        })?;
        let key: ServiceAccountKeyFile = serde_json::from_str(&content)
            .map_err(|e| normalize::from_json(e, "Invalid service account file"))?;

        Ok(Self::new(Some(key.client_email), Some(key.private_key), bucket))
    }

    /// Load options from `STOWAGE_GCS_*` environment variables.
    ///
    /// Returns `None` when no bucket is configured. Missing credentials are
    /// left as `None`, like any other unusable configuration.
    pub fn from_env() -> Option<Self> {
        let bucket = std::env::var(ENV_BUCKET).ok().filter(|b| !b.trim().is_empty())?;
        let email = std::env::var(ENV_EMAIL).ok();
        // Keys pasted into env files usually carry escaped newlines.
        let private_key = std::env::var(ENV_PRIVATE_KEY)
            .ok()
            .map(|key| SecretString::new(key.replace("\\n", "\n")));

        Some(Self::new(email, private_key, bucket))
    }

    /// Choose how public visibility is applied on save.
    pub fn with_public_acl_mode(mut self, mode: PublicAclMode) -> Self {
        self.public_acl_mode = mode;
        self
    }
}

/// Google Cloud Storage provider.
///
/// Containers map to the first segment of object names inside one bucket,
/// so `BlobId("photos", "2024/cat.png")` is stored as
/// `gs://<bucket>/photos/2024/cat.png`.
pub struct GcsProvider {
    options: GcsOptions,
    client: GcsClient,
    tokens: Arc<TokenManager>,
}

impl GcsProvider {
    /// Create a new provider.
    ///
    /// Never fails and performs no I/O; credentials are first checked by
    /// the operation that needs them.
    pub fn new(options: GcsOptions) -> Self {
        let http = Client::builder()
            .user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            options.token_endpoint.clone(),
            options.email.clone(),
            options.private_key.clone(),
        ));
        let client = GcsClient::new(
            http,
            options.bucket.clone(),
            options.api_endpoint.clone(),
            options.upload_endpoint.clone(),
            tokens.clone(),
        );

        Self {
            options,
            client,
            tokens,
        }
    }

    /// Underlying API client, for test fixtures that seed raw objects.
    pub fn client(&self) -> &GcsClient {
        &self.client
    }

    /// Bucket holding all containers.
    pub fn bucket(&self) -> &str {
        &self.options.bucket
    }

    fn to_descriptor(id: &BlobId, object: GcsObject) -> BlobDescriptor {
        let security = if object.is_public() {
            BlobSecurity::Public
        } else {
            BlobSecurity::Private
        };

        BlobDescriptor {
            id: id.clone(),
            length: object.size_bytes(),
            content_type: object
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            etag: object.etag.clone(),
            content_md5: object.md5_hash.clone(),
            last_modified: object.updated.unwrap_or_else(Utc::now),
            security,
            metadata: object.metadata,
        }
    }

    async fn make_public(&self, name: &str) -> Result<()> {
        self.client.insert_acl(name, PUBLIC_ENTITY, READER_ROLE).await
    }

    async fn make_private(&self, name: &str) -> Result<()> {
        match self.client.delete_acl(name, PUBLIC_ENTITY).await {
            // No public entry to remove.
            Err(err) if err.code() == ErrorCode::NotFound => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl StorageProvider for GcsProvider {
    fn name(&self) -> &str {
        "gcs"
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

        let name = id.object_path();
        let predefined = properties.is_public()
            && self.options.public_acl_mode == PublicAclMode::Predefined;
        let fields = ObjectFields {
            content_type: Some(properties.content_type_or_default()),
            metadata: Some(&properties.metadata),
            predefined_acl: predefined.then_some(PUBLIC_READ_ACL),
        };

        let size = data.len();
        self.client.insert_object(&name, data, &fields).await?;

        if properties.is_public() && !predefined {
            self.make_public(&name).await.map_err(|e| {
                StorageError::new(
                    e.code(),
                    format!("Uploaded {} but could not make it public: {}", id, e.message()),
                )
            })?;
        }

        tracing::debug!(bucket = %self.options.bucket, object = %name, size, "Saved GCS object");
        Ok(())
    }

    async fn fetch(&self, id: &BlobId) -> Result<BlobReader> {
        self.client.download(&id.object_path()).await
    }

    async fn delete(&self, id: &BlobId) -> Result<()> {
        let name = id.object_path();
        self.client.delete_object(&name).await?;
        tracing::debug!(bucket = %self.options.bucket, object = %name, "Deleted GCS object");
        Ok(())
    }

    /// Rewrites never carry ACLs over, so a public source is re-published
    /// on the destination the same way `save` publishes.
    async fn copy(&self, source: &BlobId, dest: &BlobId) -> Result<()> {
        let public = self.client.get_object(&source.object_path()).await?.is_public();
        let predefined = public && self.options.public_acl_mode == PublicAclMode::Predefined;

        let name = dest.object_path();
        self.client
            .copy_object(
                &source.object_path(),
                &name,
                predefined.then_some(PUBLIC_READ_ACL),
            )
            .await?;

        if public && !predefined {
            self.make_public(&name).await.map_err(|e| {
                StorageError::new(
                    e.code(),
                    format!("Copied {} but could not make it public: {}", dest, e.message()),
                )
            })?;
        }
        Ok(())
    }

    async fn generate_access_url(
        &self,
        id: &BlobId,
        options: &AccessUrlOptions,
    ) -> Result<String> {
        validate_expiry(options.expires_in)?;
        let account = self.tokens.service_account()?;

        let request = SignedUrlRequest {
            bucket: &self.options.bucket,
            id,
            options,
            now: Utc::now(),
        };
        let url = sign_url(&account, &self.options.signing_endpoint, &request)?;

        tracing::debug!(
            bucket = %self.options.bucket,
            object = %id,
            access = ?options.access,
            expires_in_secs = options.expires_in.as_secs(),
            "Generated signed URL"
        );
        Ok(url)
    }

    async fn descriptor(&self, id: &BlobId) -> Result<BlobDescriptor> {
        let object = self.client.get_object(&id.object_path()).await?;
        Ok(Self::to_descriptor(id, object))
    }

    async fn list(&self, container: &str) -> Result<Vec<BlobDescriptor>> {
        validate_container(container)?;
        let prefix = format!("{}/", container);

        let mut descriptors = Vec::new();
        for object in self.client.list_objects(&prefix).await? {
            match BlobId::parse(&object.name) {
                Ok(id) => descriptors.push(Self::to_descriptor(&id, object)),
                Err(err) => {
                    tracing::debug!(object = %object.name, error = %err, "Skipping object without a valid key");
                }
            }
        }

        descriptors.sort_by(|a, b| a.id.key().cmp(b.id.key()));
        Ok(descriptors)
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        validate_container(container)?;
        let prefix = format!("{}/", container);

        let objects = self.client.list_objects(&prefix).await?;
        let count = objects.len();
        for object in objects {
            match self.client.delete_object(&object.name).await {
                // Removed concurrently.
                Err(err) if err.code() == ErrorCode::NotFound => {}
                other => other?,
            }
        }

        tracing::debug!(bucket = %self.options.bucket, container, count, "Deleted GCS container");
        Ok(())
    }

    async fn update_properties(&self, id: &BlobId, properties: &BlobProperties) -> Result<()> {
        let name = id.object_path();
        let current = self.client.get_object(&name).await?;

        // Patching merges metadata; removed keys must be nulled explicitly.
        let mut metadata = serde_json::Map::new();
        for key in current.metadata.keys() {
            metadata.insert(key.clone(), Value::Null);
        }
        for (key, value) in &properties.metadata {
            metadata.insert(key.clone(), Value::String(value.clone()));
        }

        let mut patch = serde_json::json!({ "metadata": metadata });
        if let Some(content_type) = &properties.content_type {
            patch["contentType"] = Value::String(content_type.clone());
        }
        self.client.patch_object(&name, &patch).await?;

        match (properties.is_public(), current.is_public()) {
            (true, false) => self.make_public(&name).await,
            (false, true) => self.make_private(&name).await,
            _ => Ok(()),
        }
    }

    fn blob_url(&self, id: &BlobId) -> Result<String> {
        Ok(format!(
            "{}/{}/{}",
            self.options.signing_endpoint.trim_end_matches('/'),
            encode_component(&self.options.bucket),
            encode_path(&id.object_path())
        ))
    }
}

/// Create a GCS provider from configuration.
///
/// Accepts the [`GcsOptions`] fields, or `credentials_file` plus `bucket`
/// to read credentials from a service-account key file.
pub fn create_gcs_provider(config: Value) -> Result<Arc<dyn StorageProvider>> {
    if let Some(path) = config.get("credentials_file").and_then(Value::as_str) {
        let bucket = config
            .get("bucket")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::generic("GCS provider requires 'bucket'"))?;
        let options = GcsOptions::from_service_account_file(path, bucket)?;
        return Ok(Arc::new(GcsProvider::new(options)));
    }

    let options: GcsOptions = serde_json::from_value(config)
        .map_err(|e| normalize::from_json(e, "Invalid GCS config"))?;

    Ok(Arc::new(GcsProvider::new(options)))
}
