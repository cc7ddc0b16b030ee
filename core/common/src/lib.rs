//! Common utilities and types shared across Stowage crates.
//!
//! This crate provides the blob identifier and the normalized error
//! taxonomy that every storage backend reports through.

pub mod error;
pub mod types;

pub use error::{ErrorCode, Result, StorageError};
pub use types::{validate_container, BlobId, SecretString};
