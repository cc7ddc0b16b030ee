//! Blob storage provider abstraction for Stowage.
//!
//! This module provides a trait-based interface over blob storage backends
//! (Google Cloud Storage, local filesystem, memory) and a provider registry
//! for dynamic provider resolution.
//!
//! # Design Principles
//! - Provider isolation: callers only see [`StorageProvider`]
//! - Async operations: All I/O operations are async
//! - Normalized errors: every failure carries one of three [`ErrorCode`]s
//! - Deferred validation: credentials are checked by the first operation
//!   that needs them, never at construction
//!
//! [`ErrorCode`]: stowage_common::ErrorCode

pub mod encoding;
pub mod gcs;
pub mod local;
pub mod memory;
pub mod normalize;
pub mod provider;
pub mod registry;
pub mod testing;

pub use gcs::{create_gcs_provider, GcsOptions, GcsProvider, PublicAclMode};
pub use local::{LocalOptions, LocalProvider};
pub use memory::MemoryProvider;
pub use provider::{
    AccessUrlOptions, BlobDescriptor, BlobProperties, BlobReader, BlobSecurity, StorageProvider,
    UrlAccess, DEFAULT_CONTENT_TYPE, MAX_ACCESS_URL_EXPIRY,
};
pub use registry::{create_default_registry, ProviderFactory, ProviderRegistry};
pub use stowage_common::{BlobId, ErrorCode, Result, StorageError};
