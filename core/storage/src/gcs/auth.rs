//! Service-account authentication for Google Cloud Storage.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use stowage_common::{Result, SecretString, StorageError};

use crate::normalize;

/// OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scope covering object reads, writes and ACL changes.
pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";

/// Grant type of the signed-assertion token exchange.
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for each assertion (Google's maximum).
const ASSERTION_LIFETIME: i64 = 3600;

/// Claims of the token request assertion.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Usable service-account credentials.
///
/// Only ever built right before use, so a provider configured without
/// credentials fails on each operation rather than at construction.
pub struct ServiceAccount {
    email: String,
    private_key: SecretString,
}

impl ServiceAccount {
    /// Validate configured credential fields.
    ///
    /// # Errors
    /// - `GenericException` if either field is missing or blank
    pub fn from_parts(email: Option<&str>, private_key: Option<&SecretString>) -> Result<Self> {
        let email = email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| normalize::missing_credentials("email"))?;
        let private_key = private_key
            .filter(|k| !k.is_blank())
            .ok_or_else(|| normalize::missing_credentials("private_key"))?;

        Ok(Self {
            email: email.to_string(),
            private_key: private_key.clone(),
        })
    }

    /// Service-account email (the signing identity).
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Build the RS256 assertion exchanged for an access token.
    pub fn assertion(&self, audience: &str, now: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            iss: self.email.clone(),
            scope: STORAGE_SCOPE.to_string(),
            aud: audience.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME,
        };

        let key = EncodingKey::from_rsa_pem(self.private_key.expose().as_bytes())
            .map_err(|e| StorageError::generic(format!("Invalid private key: {}", e)))?;

        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| StorageError::generic(format!("Failed to sign token assertion: {}", e)))
    }

    /// RSA-SHA256 signature of `message` with the account's private key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let key_pair = self.key_pair()?;
        let mut signature = vec![0u8; key_pair.public().modulus_len()];

        key_pair
            .sign(&RSA_PKCS1_SHA256, &SystemRandom::new(), message, &mut signature)
            .map_err(|_| StorageError::generic("RSA signing failed"))?;

        Ok(signature)
    }

    pub(crate) fn key_pair(&self) -> Result<RsaKeyPair> {
        let (label, der) = pem_to_der(self.private_key.expose())?;
        let parsed = match label.as_str() {
            "PRIVATE KEY" => RsaKeyPair::from_pkcs8(&der),
            "RSA PRIVATE KEY" => RsaKeyPair::from_der(&der),
            other => {
                return Err(StorageError::generic(format!(
                    "Unsupported private key type: {}",
                    other
                )))
            }
        };
        parsed.map_err(|e| StorageError::generic(format!("Invalid private key: {}", e)))
    }
}

/// Decode the first PEM block, returning its label and DER bytes.
fn pem_to_der(pem: &str) -> Result<(String, Vec<u8>)> {
    let mut label: Option<String> = None;
    let mut body = String::new();

    for line in pem.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("-----BEGIN ") {
            label = Some(rest.trim_end_matches('-').to_string());
        } else if line.starts_with("-----END ") {
            break;
        } else if label.is_some() {
            body.push_str(line);
        }
    }

    let label = label.ok_or_else(|| StorageError::generic("Private key is not PEM encoded"))?;
    let der = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| StorageError::generic(format!("Invalid PEM body: {}", e)))?;

    Ok((label, der))
}

/// Cached OAuth2 access token.
#[derive(Clone)]
struct AccessToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Check if the token is expired or about to expire.
    fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

/// Hands out access tokens, exchanging a fresh assertion when needed.
///
/// Only successful exchanges are cached; failures are returned as-is and
/// the next call tries again.
pub struct TokenManager {
    http: Client,
    token_url: String,
    email: Option<String>,
    private_key: Option<SecretString>,
    cached: RwLock<Option<AccessToken>>,
}

impl TokenManager {
    /// Create a token manager. Credentials are not checked here.
    pub fn new(
        http: Client,
        token_url: impl Into<String>,
        email: Option<String>,
        private_key: Option<SecretString>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            email,
            private_key,
            cached: RwLock::new(None),
        }
    }

    /// Validated credentials, for local signing.
    pub fn service_account(&self) -> Result<ServiceAccount> {
        ServiceAccount::from_parts(self.email.as_deref(), self.private_key.as_ref())
    }

    /// Get a valid access token, exchanging a new assertion if necessary.
    ///
    /// # Errors
    /// - `GenericException` for missing credentials, an unreachable token
    ///   endpoint, or a rejected assertion
    pub async fn get_access_token(&self) -> Result<String> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
                return Ok(token.token.expose().to_string());
            }
        }

        let mut cached = self.cached.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.token.expose().to_string());
        }

        let account = self.service_account()?;
        tracing::debug!(account = %account.email(), "Requesting service account access token");

        let token = self.request_token(&account).await?;
        let value = token.token.expose().to_string();
        *cached = Some(token);

        Ok(value)
    }

    async fn request_token(&self, account: &ServiceAccount) -> Result<AccessToken> {
        let assertion = account.assertion(&self.token_url, Utc::now())?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| StorageError::generic(format!("Token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            // Any rejection here is a credential problem, whatever the status.
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::generic(format!(
                "Token exchange rejected: {} - {}",
                status,
                body.trim()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| normalize::from_transport(e, "Failed to parse token response"))?;

        let expires_in = token.expires_in.unwrap_or(ASSERTION_LIFETIME);

        Ok(AccessToken {
            token: SecretString::new(token.access_token),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
    use stowage_common::ErrorCode;

    pub(crate) const TEST_KEY: &str = include_str!("../../testdata/test-service-account.pem");
    pub(crate) const TEST_EMAIL: &str = "tester@stowage-test.iam.gserviceaccount.com";

    pub(crate) fn test_account() -> ServiceAccount {
        ServiceAccount::from_parts(Some(TEST_EMAIL), Some(&SecretString::new(TEST_KEY))).unwrap()
    }

    #[test]
    fn test_missing_credentials() {
        let key = SecretString::new(TEST_KEY);

        let err = ServiceAccount::from_parts(None, Some(&key)).err().unwrap();
        assert_eq!(err.code(), ErrorCode::GenericException);

        let err = ServiceAccount::from_parts(Some(TEST_EMAIL), None).err().unwrap();
        assert_eq!(err.code(), ErrorCode::GenericException);

        let blank = SecretString::new("   ");
        assert!(ServiceAccount::from_parts(Some(" "), Some(&key)).is_err());
        assert!(ServiceAccount::from_parts(Some(TEST_EMAIL), Some(&blank)).is_err());
    }

    #[test]
    fn test_sign_verifies_with_public_key() {
        let account = test_account();
        let message = b"GOOG4-RSA-SHA256\n20240101T000000Z";

        let signature = account.sign(message).unwrap();
        let key_pair = account.key_pair().unwrap();
        let public_key =
            UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, key_pair.public().as_ref());

        assert!(public_key.verify(message, &signature).is_ok());
        assert!(public_key.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_assertion_claims() {
        let account = test_account();
        let now = Utc::now();
        let jwt = account.assertion(GOOGLE_TOKEN_URL, now).unwrap();

        let key_pair = account.key_pair().unwrap();
        let decoding_key = DecodingKey::from_rsa_der(key_pair.public().as_ref());
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[GOOGLE_TOKEN_URL]);

        let claims = decode::<Claims>(&jwt, &decoding_key, &validation)
            .unwrap()
            .claims;
        assert_eq!(claims.iss, TEST_EMAIL);
        assert_eq!(claims.scope, STORAGE_SCOPE);
        assert_eq!(claims.exp - claims.iat, ASSERTION_LIFETIME);
    }

    #[test]
    fn test_garbage_key_is_generic() {
        let key = SecretString::new("not a pem");
        let account = ServiceAccount::from_parts(Some(TEST_EMAIL), Some(&key)).unwrap();

        assert_eq!(
            account.sign(b"x").unwrap_err().code(),
            ErrorCode::GenericException
        );
        assert_eq!(
            account.assertion(GOOGLE_TOKEN_URL, Utc::now()).unwrap_err().code(),
            ErrorCode::GenericException
        );
    }

    #[test]
    fn test_token_expiration() {
        let expired = AccessToken {
            token: SecretString::new("t"),
            expires_at: Utc::now() + Duration::minutes(4),
        };
        assert!(expired.is_expired());

        let valid = AccessToken {
            token: SecretString::new("t"),
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!valid.is_expired());
    }

    #[tokio::test]
    async fn test_missing_credentials_never_cached() {
        let manager = TokenManager::new(Client::new(), GOOGLE_TOKEN_URL, None, None);

        for _ in 0..2 {
            let err = manager.get_access_token().await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::GenericException);
        }
        assert!(manager.cached.read().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_token_endpoint_is_generic() {
        let manager = TokenManager::new(
            Client::new(),
            "http://127.0.0.1:9/token",
            Some(TEST_EMAIL.to_string()),
            Some(SecretString::new(TEST_KEY)),
        );

        let err = manager.get_access_token().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenericException);
        assert!(err.message().contains("Token request failed"));
    }
}
