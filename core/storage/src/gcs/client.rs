//! Google Cloud Storage JSON API client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use stowage_common::{BlobId, Result, StorageError};

use super::auth::TokenManager;
use crate::encoding::encode_component;
use crate::normalize;
use crate::provider::{BlobReader, DEFAULT_CONTENT_TYPE};
use crate::testing::RawSeeder;

/// Default JSON API base URL.
pub const GCS_API_BASE: &str = "https://storage.googleapis.com/storage/v1";
/// Default upload API base URL.
pub const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

/// ACL entity granting access to everyone.
pub const PUBLIC_ENTITY: &str = "allUsers";
/// ACL role for read access.
pub const READER_ROLE: &str = "READER";
/// Predefined ACL that makes a new object publicly readable.
pub const PUBLIC_READ_ACL: &str = "publicRead";

/// Uploads above this size go through a resumable session.
const RESUMABLE_THRESHOLD: usize = 5 * 1024 * 1024; // 5MB

/// Chunk size for resumable uploads (must be a multiple of 256KB).
const CHUNK_SIZE: usize = 256 * 1024; // 256KB

/// One entry of an object's access control list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAccessControl {
    pub entity: String,
    pub role: String,
}

/// Object resource as returned by the JSON API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsObject {
    /// Full object name (`container/key`).
    pub name: String,
    /// Size in bytes, encoded as a string by the API.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Base64 MD5 of the content.
    #[serde(default)]
    pub md5_hash: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Only present with `projection=full`.
    #[serde(default)]
    pub acl: Vec<ObjectAccessControl>,
}

impl GcsObject {
    /// Get size as u64.
    pub fn size_bytes(&self) -> u64 {
        self.size
            .as_ref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Whether everyone may read the object.
    pub fn is_public(&self) -> bool {
        self.acl
            .iter()
            .any(|entry| entry.entity == PUBLIC_ENTITY && entry.role == READER_ROLE)
    }
}

/// Response from listing objects.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Response from a rewrite (server-side copy) step.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    done: bool,
    #[serde(default)]
    rewrite_token: Option<String>,
}

/// Fields written alongside new content.
#[derive(Debug, Clone, Default)]
pub struct ObjectFields<'a> {
    pub content_type: Option<&'a str>,
    pub metadata: Option<&'a BTreeMap<String, String>>,
    pub predefined_acl: Option<&'a str>,
}

/// Raw object operations against one bucket.
pub struct GcsClient {
    http: Client,
    bucket: String,
    api_base: String,
    upload_base: String,
    tokens: Arc<TokenManager>,
}

impl GcsClient {
    /// Create a new client.
    pub fn new(
        http: Client,
        bucket: impl Into<String>,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            http,
            bucket: bucket.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            upload_base: upload_base.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Bucket this client operates on.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.tokens.get_access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    fn bucket_url(&self) -> String {
        format!("{}/b/{}", self.api_base, encode_component(&self.bucket))
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/o/{}", self.bucket_url(), encode_component(name))
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response> {
        let auth = self.auth_header().await?;
        request
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| normalize::from_transport(e, context))
    }

    /// Get object metadata, including its ACL.
    pub async fn get_object(&self, name: &str) -> Result<GcsObject> {
        let request = self
            .http
            .get(self.object_url(name))
            .query(&[("projection", "full")]);

        let response = self.send(request, "Failed to get object").await?;
        handle_response(response, "Failed to get object").await
    }

    /// Upload an object, choosing multipart or resumable by size.
    pub async fn insert_object(
        &self,
        name: &str,
        data: Vec<u8>,
        fields: &ObjectFields<'_>,
    ) -> Result<GcsObject> {
        if data.len() > RESUMABLE_THRESHOLD {
            self.upload_resumable(name, data, fields).await
        } else {
            self.upload_multipart(name, data, fields).await
        }
    }

    fn upload_metadata(name: &str, fields: &ObjectFields<'_>) -> serde_json::Value {
        let mut metadata = serde_json::json!({
            "name": name,
            "contentType": fields.content_type.unwrap_or(DEFAULT_CONTENT_TYPE),
        });
        if let Some(custom) = fields.metadata.filter(|m| !m.is_empty()) {
            metadata["metadata"] = serde_json::json!(custom);
        }
        metadata
    }

    fn upload_request(&self, upload_type: &str, fields: &ObjectFields<'_>) -> RequestBuilder {
        let url = format!("{}/b/{}/o", self.upload_base, encode_component(&self.bucket));
        let mut request = self
            .http
            .post(url)
            .query(&[("uploadType", upload_type), ("projection", "full")]);
        if let Some(acl) = fields.predefined_acl {
            request = request.query(&[("predefinedAcl", acl)]);
        }
        request
    }

    /// Upload a small object in one multipart request.
    pub async fn upload_multipart(
        &self,
        name: &str,
        data: Vec<u8>,
        fields: &ObjectFields<'_>,
    ) -> Result<GcsObject> {
        let metadata_json = serde_json::to_string(&Self::upload_metadata(name, fields))
            .map_err(|e| normalize::from_json(e, "Failed to serialize metadata"))?;

        let boundary = format!("stowage-{}", Uuid::new_v4().simple());
        let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);

        // Metadata part
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");

        // Data part
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Type: {}\r\n\r\n",
                fields.content_type.unwrap_or(DEFAULT_CONTENT_TYPE)
            )
            .as_bytes(),
        );
        body.extend_from_slice(&data);
        body.extend_from_slice(b"\r\n");

        // End boundary
        body.extend_from_slice(format!("--{}--", boundary).as_bytes());

        let request = self
            .upload_request("multipart", fields)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body);

        let response = self.send(request, "Failed to upload object").await?;
        handle_response(response, "Failed to upload object").await
    }

    /// Start a resumable upload session.
    pub async fn start_resumable_upload(
        &self,
        name: &str,
        total_size: u64,
        fields: &ObjectFields<'_>,
    ) -> Result<String> {
        let request = self
            .upload_request("resumable", fields)
            .header(
                "X-Upload-Content-Type",
                fields.content_type.unwrap_or(DEFAULT_CONTENT_TYPE),
            )
            .header("X-Upload-Content-Length", total_size.to_string())
            .json(&Self::upload_metadata(name, fields));

        let response = self
            .send(request, "Failed to start resumable upload")
            .await?;
        let response = check_status(response, "Failed to start resumable upload").await?;

        // Extract upload URI from Location header
        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| StorageError::generic("No upload URI in response"))?
            .to_str()
            .map_err(|e| StorageError::generic(format!("Invalid upload URI: {}", e)))?
            .to_string();

        Ok(upload_uri)
    }

    /// Upload a chunk to a resumable upload session.
    ///
    /// Returns the object once the final chunk is accepted.
    pub async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: &[u8],
        start_byte: u64,
        total_size: u64,
    ) -> Result<Option<GcsObject>> {
        let end_byte = start_byte + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", start_byte, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| normalize::from_transport(e, "Failed to upload chunk"))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                handle_response(response, "Failed to upload chunk").await.map(Some)
            }
            // 308 Resume Incomplete: more chunks needed
            StatusCode::PERMANENT_REDIRECT => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(normalize::from_status(status, "Chunk upload failed", &body))
            }
        }
    }

    /// Upload a large object through a resumable session.
    pub async fn upload_resumable(
        &self,
        name: &str,
        data: Vec<u8>,
        fields: &ObjectFields<'_>,
    ) -> Result<GcsObject> {
        let total_size = data.len() as u64;
        let upload_uri = self.start_resumable_upload(name, total_size, fields).await?;

        let mut bytes_uploaded = 0u64;
        for chunk in data.chunks(CHUNK_SIZE) {
            let result = self
                .upload_chunk(&upload_uri, chunk, bytes_uploaded, total_size)
                .await?;
            bytes_uploaded += chunk.len() as u64;

            if let Some(object) = result {
                return Ok(object);
            }
        }

        Err(StorageError::generic(format!(
            "Upload of {} did not complete",
            name
        )))
    }

    /// Stream object content.
    pub async fn download(&self, name: &str) -> Result<BlobReader> {
        let request = self.http.get(self.object_url(name)).query(&[("alt", "media")]);

        let response = self.send(request, "Failed to download object").await?;
        let response = check_status(response, "Download failed").await?;

        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    /// List objects whose names start with `prefix`.
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<GcsObject>> {
        let mut all_objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(format!("{}/o", self.bucket_url())).query(&[
                ("prefix", prefix),
                ("projection", "full"),
                ("maxResults", "1000"),
            ]);

            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = self.send(request, "Failed to list objects").await?;
            let list_response: ObjectListResponse =
                handle_response(response, "Failed to list objects").await?;
            all_objects.extend(list_response.items);

            match list_response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_objects)
    }

    /// Delete an object.
    pub async fn delete_object(&self, name: &str) -> Result<()> {
        let request = self.http.delete(self.object_url(name));
        let response = self.send(request, "Failed to delete object").await?;
        check_status(response, "Delete failed").await.map(|_| ())
    }

    /// Server-side copy within the bucket.
    ///
    /// Large objects may need several rewrite calls; each returns a token
    /// to resume from. Without `predefined_acl` the destination gets the
    /// bucket's default object ACL, not the source's.
    pub async fn copy_object(
        &self,
        source: &str,
        dest: &str,
        predefined_acl: Option<&str>,
    ) -> Result<()> {
        let url = format!(
            "{}/rewriteTo/b/{}/o/{}",
            self.object_url(source),
            encode_component(&self.bucket),
            encode_component(dest)
        );
        let mut rewrite_token: Option<String> = None;

        loop {
            let mut request = self.http.post(&url).json(&serde_json::json!({}));
            if let Some(acl) = predefined_acl {
                request = request.query(&[("destinationPredefinedAcl", acl)]);
            }
            if let Some(token) = &rewrite_token {
                request = request.query(&[("rewriteToken", token.as_str())]);
            }

            let response = self.send(request, "Failed to copy object").await?;
            let rewrite: RewriteResponse =
                handle_response(response, "Failed to copy object").await?;

            if rewrite.done {
                return Ok(());
            }
            match rewrite.rewrite_token {
                Some(token) => rewrite_token = Some(token),
                None => {
                    return Err(StorageError::generic(format!(
                        "Copy of {} stalled without a rewrite token",
                        source
                    )))
                }
            }
        }
    }

    /// Patch object metadata fields.
    pub async fn patch_object(&self, name: &str, patch: &serde_json::Value) -> Result<GcsObject> {
        let request = self.http.patch(self.object_url(name)).json(patch);
        let response = self.send(request, "Failed to update object").await?;
        handle_response(response, "Failed to update object").await
    }

    /// Grant `role` on an object to `entity`.
    pub async fn insert_acl(&self, name: &str, entity: &str, role: &str) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/acl", self.object_url(name)))
            .json(&ObjectAccessControl {
                entity: entity.to_string(),
                role: role.to_string(),
            });

        let response = self.send(request, "Failed to update object ACL").await?;
        check_status(response, "Failed to update object ACL")
            .await
            .map(|_| ())
    }

    /// Remove `entity` from an object's ACL.
    pub async fn delete_acl(&self, name: &str, entity: &str) -> Result<()> {
        let request = self.http.delete(format!(
            "{}/acl/{}",
            self.object_url(name),
            encode_component(entity)
        ));

        let response = self.send(request, "Failed to update object ACL").await?;
        check_status(response, "Failed to update object ACL")
            .await
            .map(|_| ())
    }
}

/// Pass a successful response through, or normalize the failure.
async fn check_status(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(normalize::from_status(status, context, &body))
}

/// Handle API response with error checking.
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: Response,
    context: &str,
) -> Result<T> {
    check_status(response, context)
        .await?
        .json()
        .await
        .map_err(|e| StorageError::generic(format!("{}: invalid response: {}", context, e)))
}

#[async_trait]
impl RawSeeder for GcsClient {
    async fn seed_object(
        &self,
        id: &BlobId,
        data: Vec<u8>,
        content_type: Option<&str>,
        public: bool,
    ) -> Result<()> {
        let fields = ObjectFields {
            content_type,
            metadata: None,
            predefined_acl: public.then_some(PUBLIC_READ_ACL),
        };
        self.insert_object(&id.object_path(), data, &fields)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_common::ErrorCode;

    fn offline_client() -> GcsClient {
        let tokens = Arc::new(TokenManager::new(
            Client::new(),
            "http://127.0.0.1:9/token",
            None,
            None,
        ));
        GcsClient::new(
            Client::new(),
            "my bucket",
            "https://storage.googleapis.com/storage/v1/",
            GCS_UPLOAD_BASE,
            tokens,
        )
    }

    #[test]
    fn test_object_deserialization() {
        let json = r#"{
            "kind": "storage#object",
            "name": "photos/cat.png",
            "bucket": "b",
            "size": "12345",
            "contentType": "image/png",
            "md5Hash": "XrY7u+Ae7tCTyyK7j1rNww==",
            "etag": "CJjh6ovvhoMDEAE=",
            "updated": "2024-03-01T12:30:00.123Z",
            "metadata": {"owner": "ops"},
            "acl": [
                {"entity": "project-owners-1", "role": "OWNER"},
                {"entity": "allUsers", "role": "READER"}
            ]
        }"#;

        let object: GcsObject = serde_json::from_str(json).unwrap();
        assert_eq!(object.name, "photos/cat.png");
        assert_eq!(object.size_bytes(), 12345);
        assert_eq!(object.content_type.as_deref(), Some("image/png"));
        assert_eq!(object.metadata.get("owner").map(String::as_str), Some("ops"));
        assert!(object.updated.is_some());
        assert!(object.is_public());
    }

    #[test]
    fn test_minimal_object_is_private() {
        let object: GcsObject = serde_json::from_str(r#"{"name": "c/k"}"#).unwrap();
        assert_eq!(object.size_bytes(), 0);
        assert!(!object.is_public());
        assert!(object.metadata.is_empty());
    }

    #[test]
    fn test_object_url_encoding() {
        let client = offline_client();
        assert_eq!(
            client.object_url("photos/my cat.png"),
            "https://storage.googleapis.com/storage/v1/b/my%20bucket/o/photos%2Fmy%20cat.png"
        );
    }

    #[test]
    fn test_upload_metadata() {
        let mut custom = BTreeMap::new();
        custom.insert("owner".to_string(), "ops".to_string());
        let fields = ObjectFields {
            content_type: None,
            metadata: Some(&custom),
            predefined_acl: None,
        };

        let metadata = GcsClient::upload_metadata("c/k", &fields);
        assert_eq!(metadata["name"], "c/k");
        assert_eq!(metadata["contentType"], DEFAULT_CONTENT_TYPE);
        assert_eq!(metadata["metadata"]["owner"], "ops");
    }

    #[tokio::test]
    async fn test_requests_without_credentials_fail_generic() {
        let client = offline_client();

        let err = client.get_object("c/k").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenericException);

        let err = client.download("c/k").await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::GenericException);

        let err = client.list_objects("c/").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenericException);
    }
}
