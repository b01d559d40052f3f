//! The storage driver persists blob and manifest bytes in an opaque backend,
//! one address space per account. The database, not the backend, is the
//! source of truth for references; orphaned backend objects are reconciled
//! by the storage-sweep job.

pub mod filesystem;
pub mod memory;

use async_trait::async_trait;
use std::fmt::{self, Display, Formatter};
use tokio::io::AsyncRead;

pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Debug)]
pub enum StorageError {
    /// The requested object does not exist in the backend.
    NotFound,
    /// Append after finalize, chunk numbers out of order, and similar misuse.
    InvalidOperation(String),
    /// Account cleanup refused because objects remain.
    AccountNotEmpty(u64),
    Backend(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "object not found in storage"),
            StorageError::InvalidOperation(msg) => write!(f, "invalid storage operation: {msg}"),
            StorageError::AccountNotEmpty(count) => {
                write!(f, "cannot clean up storage for account: {count} objects remain")
            }
            StorageError::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound
        } else {
            StorageError::Backend(err.to_string())
        }
    }
}

/// What `list_storage_contents` reports for the storage-sweep job.
#[derive(Debug, Default, Clone)]
pub struct StorageContents {
    pub blobs: Vec<StoredBlobInfo>,
    pub manifests: Vec<StoredManifestInfo>,
}

#[derive(Debug, Clone)]
pub struct StoredBlobInfo {
    pub storage_id: String,
    /// Number of chunks for unfinalized uploads; needed to abort them.
    pub chunk_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredManifestInfo {
    pub repo_name: String,
    pub digest: String,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn plugin_type_id(&self) -> &'static str;

    /// Appends a chunk to the blob identified by `storage_id`. Chunk numbers
    /// must increase monotonically starting at 1; appending to a finalized
    /// blob is an error. `chunk_length` is a hint for backends that need the
    /// length up front; the chunk must be read to EOF either way.
    async fn append_to_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_number: u32,
        chunk_length: Option<u64>,
        chunk: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), StorageError>;

    /// Seals the blob. Idempotent.
    async fn finalize_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_count: u32,
    ) -> Result<(), StorageError>;

    /// Discards an unfinalized upload. Fails on finalized blobs.
    async fn abort_blob_upload(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_count: u32,
    ) -> Result<(), StorageError>;

    async fn read_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<(BlobReader, u64), StorageError>;

    /// A URL the client can be redirected to for this blob, or None when the
    /// backend cannot generate one and the caller must stream through itself.
    async fn url_for_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<Option<String>, StorageError>;

    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<(), StorageError>;

    async fn read_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Vec<u8>, StorageError>;

    async fn write_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        contents: &[u8],
    ) -> Result<(), StorageError>;

    async fn delete_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), StorageError>;

    /// Per-manifest security scan report, keyed additionally by format.
    async fn read_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<Vec<u8>, StorageError>;

    async fn write_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
        contents: &[u8],
    ) -> Result<(), StorageError>;

    async fn delete_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<(), StorageError>;

    /// Enumerates everything stored for this account, for the storage-sweep
    /// job to compare against the database.
    async fn list_storage_contents(&self, account_name: &str) -> Result<StorageContents, StorageError>;

    /// Lifecycle hook called before the account row is created.
    async fn can_setup_account(&self, account_name: &str) -> Result<(), StorageError>;

    /// Lifecycle hook called while deleting the account row. Must refuse if
    /// blobs or manifests remain.
    async fn cleanup_account(&self, account_name: &str) -> Result<(), StorageError>;
}

/// Generates a fresh opaque storage ID.
pub fn generate_storage_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
