//! Test harness shared by backend test suites.
//!
//! Nothing in here is part of the storage interface. It builds random
//! payloads and names, compares streams, asserts the failure contract of
//! mis-configured providers, and exposes [`RawSeeder`] for the rare
//! fixture that has to bypass [`StorageProvider`] to seed data.

use async_trait::async_trait;
use rand::RngCore;
use std::future::Future;
use std::io::{self, Cursor, SeekFrom};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use uuid::Uuid;

use stowage_common::{BlobId, ErrorCode, Result, StorageError};

use crate::provider::{BlobProperties, StorageProvider};

/// Default payload size for generated blobs.
pub const DEFAULT_BLOB_LENGTH: usize = 256;

/// Prefix for containers created by test runs.
pub const CONTAINER_PREFIX: &str = "stowage-test-";

/// Chunk size used by the stream comparators.
pub const COMPARE_CHUNK_SIZE: usize = 2048;

/// Direct backend access for test setup only.
///
/// Seeds objects without going through [`StorageProvider::save`], so a
/// test can check the provider against data it did not write itself.
#[async_trait]
pub trait RawSeeder: Send + Sync {
    /// Store an object as-is, optionally publicly readable.
    async fn seed_object(
        &self,
        id: &BlobId,
        data: Vec<u8>,
        content_type: Option<&str>,
        public: bool,
    ) -> Result<()>;
}

/// Random bytes of the given length.
pub fn generate_random_blob(length: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut buffer);
    buffer
}

/// Random bytes wrapped in a seekable reader.
pub fn generate_random_blob_stream(length: usize) -> Cursor<Vec<u8>> {
    Cursor::new(generate_random_blob(length))
}

/// Hyphen-less UUID, unique enough for keys and containers.
pub fn generate_random_name() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh container name under `prefix`.
pub fn random_container_name(prefix: &str) -> String {
    format!("{}{}", prefix, generate_random_name())
}

/// Fresh identifier in a fresh test container.
pub fn random_blob_id() -> BlobId {
    BlobId::new(
        random_container_name(CONTAINER_PREFIX),
        generate_random_name(),
    )
    .expect("generated names are valid")
}

/// Compare two seekable streams from their beginning.
///
/// Both streams are rewound first, so the result does not depend on where
/// either was positioned.
pub async fn stream_equals<A, B>(a: &mut A, b: &mut B) -> io::Result<bool>
where
    A: AsyncRead + AsyncSeek + Unpin,
    B: AsyncRead + AsyncSeek + Unpin,
{
    a.seek(SeekFrom::Start(0)).await?;
    b.seek(SeekFrom::Start(0)).await?;
    reader_equals(a, b).await
}

/// Compare two readers from their current position.
///
/// Reads both in [`COMPARE_CHUNK_SIZE`] chunks and stops at the first chunk
/// whose length or content differs.
pub async fn reader_equals<A, B>(a: &mut A, b: &mut B) -> io::Result<bool>
where
    A: AsyncRead + Unpin,
    B: AsyncRead + Unpin,
{
    let mut buffer_a = vec![0u8; COMPARE_CHUNK_SIZE];
    let mut buffer_b = vec![0u8; COMPARE_CHUNK_SIZE];

    loop {
        let count_a = read_chunk(a, &mut buffer_a).await?;
        let count_b = read_chunk(b, &mut buffer_b).await?;

        if count_a != count_b {
            return Ok(false);
        }
        if count_a == 0 {
            return Ok(true);
        }
        if buffer_a[..count_a] != buffer_b[..count_b] {
            return Ok(false);
        }
    }
}

/// Fill `buffer` unless the reader ends first; short reads are retried.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Panic unless `result` failed with `GenericException`.
pub fn assert_generic_failure<T>(result: Result<T>) -> StorageError {
    match result {
        Ok(_) => panic!("expected GenericException, operation succeeded"),
        Err(err) => {
            assert_eq!(
                err.code(),
                ErrorCode::GenericException,
                "unexpected error: {}",
                err
            );
            err
        }
    }
}

/// Run `op` against a mis-configured provider, expecting `GenericException`,
/// then against a working provider, returning its result.
pub async fn assert_provider_auth<T, F, Fut>(
    invalid: Arc<dyn StorageProvider>,
    valid: Arc<dyn StorageProvider>,
    op: F,
) -> Result<T>
where
    F: Fn(Arc<dyn StorageProvider>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    assert_generic_failure(op(invalid).await);
    op(valid).await
}

/// Canonical round trip every backend must pass: save 256 random bytes
/// under a fresh key, fetch them back, compare, clean up.
pub async fn run_smoke_test(provider: &dyn StorageProvider) -> Result<()> {
    let id = random_blob_id();
    let mut payload = generate_random_blob_stream(DEFAULT_BLOB_LENGTH);

    provider
        .save(&id, &mut payload, &BlobProperties::default())
        .await?;

    let mut fetched = Cursor::new(provider.fetch_bytes(&id).await?);
    let equal = stream_equals(&mut payload, &mut fetched)
        .await
        .map_err(crate::normalize::from_io)?;
    assert!(equal, "fetched content differs from saved content for {}", id);

    provider.delete(&id).await
}

/// A key and a key nested below it are independent blobs: both can be
/// stored, read back, listed and deleted without affecting each other.
pub async fn run_nested_key_test(provider: &dyn StorageProvider) -> Result<()> {
    let parent = random_blob_id();
    let child = parent.with_key(format!("{}/child", parent.key()))?;

    provider
        .save_bytes(&parent, b"parent".to_vec(), &BlobProperties::default())
        .await?;
    provider
        .save_bytes(&child, b"child".to_vec(), &BlobProperties::default())
        .await?;

    assert_eq!(provider.fetch_bytes(&parent).await?, b"parent", "{}", parent);
    assert_eq!(provider.fetch_bytes(&child).await?, b"child", "{}", child);

    let listed: Vec<BlobId> = provider
        .list(parent.container())
        .await?
        .into_iter()
        .map(|descriptor| descriptor.id)
        .collect();
    assert!(listed.contains(&parent) && listed.contains(&child), "{:?}", listed);

    provider.delete(&parent).await?;
    assert_eq!(provider.fetch_bytes(&child).await?, b"child", "{}", child);
    provider.delete(&child).await
}
