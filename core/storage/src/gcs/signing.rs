//! V4 signed URLs for Google Cloud Storage.
//!
//! URLs are signed locally with the service-account key; nothing here
//! talks to the network.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

use stowage_common::{BlobId, Result, StorageError};

use super::auth::ServiceAccount;
use crate::encoding::{encode_component, encode_path};
use crate::provider::{AccessUrlOptions, UrlAccess};

const SIGNING_ALGORITHM: &str = "GOOG4-RSA-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// One URL to sign.
#[derive(Debug, Clone)]
pub struct SignedUrlRequest<'a> {
    pub bucket: &'a str,
    pub id: &'a BlobId,
    pub options: &'a AccessUrlOptions,
    pub now: DateTime<Utc>,
}

/// Canonical pieces of a signed URL, kept apart for inspection.
#[derive(Debug)]
struct Canonical {
    origin: String,
    path: String,
    query: String,
    request: String,
    datetime: String,
    scope: String,
}

/// Signing endpoint split into origin, host header and base path.
struct Endpoint {
    origin: String,
    host: String,
    base_path: String,
}

impl Endpoint {
    fn parse(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| StorageError::generic(format!("Invalid signing endpoint: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| StorageError::generic("Signing endpoint has no host"))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            origin: format!("{}://{}", url.scheme(), host),
            host,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }
}

/// Build a V4 signed URL granting `request.options.access` on one object.
pub fn sign_url(
    account: &ServiceAccount,
    endpoint: &str,
    request: &SignedUrlRequest<'_>,
) -> Result<String> {
    let canonical = canonicalize(account.email(), endpoint, request)?;
    let signature = account.sign(string_to_sign(&canonical).as_bytes())?;

    Ok(format!(
        "{}{}?{}&X-Goog-Signature={}",
        canonical.origin,
        canonical.path,
        canonical.query,
        hex::encode(signature)
    ))
}

fn canonicalize(
    email: &str,
    endpoint: &str,
    request: &SignedUrlRequest<'_>,
) -> Result<Canonical> {
    let endpoint = Endpoint::parse(endpoint)?;
    let options = request.options;

    let datetime = request.now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{}/auto/storage/goog4_request", request.now.format("%Y%m%d"));

    let mut headers = vec![("host".to_string(), endpoint.host.clone())];
    if options.access == UrlAccess::Write {
        if let Some(content_type) = &options.content_type {
            headers.push(("content-type".to_string(), content_type.clone()));
        }
    }
    headers.sort();

    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();

    let mut params = vec![
        ("X-Goog-Algorithm".to_string(), SIGNING_ALGORITHM.to_string()),
        ("X-Goog-Credential".to_string(), format!("{}/{}", email, scope)),
        ("X-Goog-Date".to_string(), datetime.clone()),
        ("X-Goog-Expires".to_string(), expiry_seconds(options.expires_in)),
        ("X-Goog-SignedHeaders".to_string(), signed_headers.clone()),
    ];
    if options.access == UrlAccess::Read {
        if let Some(name) = &options.download_name {
            params.push((
                "response-content-disposition".to_string(),
                format!("attachment; filename=\"{}\"", name.replace('"', "")),
            ));
        }
        if let Some(content_type) = &options.content_type {
            params.push(("response-content-type".to_string(), content_type.clone()));
        }
    }

    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode_component(k), encode_component(v)))
        .collect();
    encoded.sort();
    let query = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let path = format!(
        "{}/{}/{}",
        endpoint.base_path,
        request.bucket,
        encode_path(&request.id.object_path())
    );

    let canonical_request = [
        options.access.http_method(),
        path.as_str(),
        query.as_str(),
        canonical_headers.as_str(),
        signed_headers.as_str(),
        UNSIGNED_PAYLOAD,
    ]
    .join("\n");

    Ok(Canonical {
        origin: endpoint.origin,
        path,
        query,
        request: canonical_request,
        datetime,
        scope,
    })
}

fn string_to_sign(canonical: &Canonical) -> String {
    let digest = Sha256::digest(canonical.request.as_bytes());
    format!(
        "{}\n{}\n{}\n{}",
        SIGNING_ALGORITHM,
        canonical.datetime,
        canonical.scope,
        hex::encode(digest)
    )
}

fn expiry_seconds(expires_in: Duration) -> String {
    expires_in.as_secs().max(1).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcs::auth::tests::{test_account, TEST_EMAIL};
    use chrono::TimeZone;
    use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    fn query_param(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_read_url_shape() {
        let account = test_account();
        let id = BlobId::new("reports", "2024/q1 summary.pdf").unwrap();
        let options = AccessUrlOptions::read(Duration::from_secs(900))
            .with_download_name("summary.pdf");
        let request = SignedUrlRequest {
            bucket: "stowage-bucket",
            id: &id,
            options: &options,
            now: fixed_now(),
        };

        let signed = sign_url(&account, "https://storage.googleapis.com", &request).unwrap();
        let url = Url::parse(&signed).unwrap();

        assert_eq!(url.host_str(), Some("storage.googleapis.com"));
        assert_eq!(url.path(), "/stowage-bucket/reports/2024/q1%20summary.pdf");
        assert_eq!(query_param(&url, "X-Goog-Algorithm").as_deref(), Some(SIGNING_ALGORITHM));
        assert_eq!(query_param(&url, "X-Goog-Expires").as_deref(), Some("900"));
        assert_eq!(query_param(&url, "X-Goog-Date").as_deref(), Some("20240301T123000Z"));
        assert_eq!(query_param(&url, "X-Goog-SignedHeaders").as_deref(), Some("host"));
        assert_eq!(
            query_param(&url, "X-Goog-Credential"),
            Some(format!("{}/20240301/auto/storage/goog4_request", TEST_EMAIL))
        );
        assert_eq!(
            query_param(&url, "response-content-disposition").as_deref(),
            Some("attachment; filename=\"summary.pdf\"")
        );
    }

    #[test]
    fn test_write_url_signs_content_type() {
        let account = test_account();
        let id = BlobId::new("uploads", "data.csv").unwrap();
        let options = AccessUrlOptions::write(Duration::from_secs(60)).with_content_type("text/csv");
        let request = SignedUrlRequest {
            bucket: "b",
            id: &id,
            options: &options,
            now: fixed_now(),
        };

        let canonical = canonicalize(TEST_EMAIL, "https://storage.googleapis.com", &request).unwrap();
        assert!(canonical.request.starts_with("PUT\n/b/uploads/data.csv\n"));
        assert!(canonical.request.contains("content-type:text/csv\nhost:storage.googleapis.com\n"));
        assert!(canonical.query.contains("X-Goog-SignedHeaders=content-type%3Bhost"));
        assert!(!canonical.query.contains("response-content-type"));

        let signed = sign_url(&account, "https://storage.googleapis.com", &request).unwrap();
        assert!(signed.contains("X-Goog-SignedHeaders=content-type%3Bhost"));
    }

    #[test]
    fn test_signature_verifies() {
        let account = test_account();
        let id = BlobId::new("c", "k").unwrap();
        let options = AccessUrlOptions::read(Duration::from_secs(300));
        let request = SignedUrlRequest {
            bucket: "bucket",
            id: &id,
            options: &options,
            now: fixed_now(),
        };

        let signed = sign_url(&account, "http://127.0.0.1:4443/", &request).unwrap();
        let url = Url::parse(&signed).unwrap();
        assert_eq!(url.port(), Some(4443));

        let canonical = canonicalize(TEST_EMAIL, "http://127.0.0.1:4443/", &request).unwrap();
        assert!(canonical.request.contains("host:127.0.0.1:4443\n"));
        let signature = hex::decode(query_param(&url, "X-Goog-Signature").unwrap()).unwrap();

        let key_pair = account.key_pair().unwrap();
        let public_key =
            UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, key_pair.public().as_ref());
        assert!(public_key
            .verify(string_to_sign(&canonical).as_bytes(), &signature)
            .is_ok());
    }

    #[test]
    fn test_invalid_endpoint() {
        let account = test_account();
        let id = BlobId::new("c", "k").unwrap();
        let options = AccessUrlOptions::read(Duration::from_secs(1));
        let request = SignedUrlRequest {
            bucket: "bucket",
            id: &id,
            options: &options,
            now: fixed_now(),
        };

        assert!(sign_url(&account, "not a url", &request).is_err());
    }
}
