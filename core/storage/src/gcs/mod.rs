//! Google Cloud Storage provider.
//!
//! This module provides a storage backend using Google Cloud Storage with:
//! - Service-account authentication with cached access tokens
//! - Multipart and resumable uploads
//! - Locally signed V4 access URLs
//! - Full StorageProvider trait implementation

pub mod auth;
pub mod client;
pub mod provider;
pub mod signing;

#[cfg(test)]
mod stub;

pub use auth::{ServiceAccount, TokenManager};
pub use client::{GcsClient, GcsObject};
pub use provider::{create_gcs_provider, GcsOptions, GcsProvider, PublicAclMode};
