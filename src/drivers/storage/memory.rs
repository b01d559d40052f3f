//! In-memory storage driver for tests and single-process development setups.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    BlobReader, StorageContents, StorageDriver, StorageError, StoredBlobInfo, StoredManifestInfo,
};

#[derive(Default)]
struct BlobRecord {
    chunks: Vec<Vec<u8>>,
    finalized: bool,
}

#[derive(Default)]
struct AccountSpace {
    blobs: HashMap<String, BlobRecord>,
    manifests: HashMap<(String, String), Vec<u8>>,
    scan_reports: HashMap<(String, String, String), Vec<u8>>,
}

#[derive(Default)]
pub struct InMemoryDriver {
    accounts: RwLock<HashMap<String, AccountSpace>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    fn plugin_type_id(&self) -> &'static str {
        "in-memory"
    }

    async fn append_to_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_number: u32,
        _chunk_length: Option<u64>,
        chunk: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        chunk.read_to_end(&mut buf).await?;

        let mut accounts = self.accounts.write().unwrap();
        let space = accounts.entry(account_name.to_string()).or_default();
        let record = space.blobs.entry(storage_id.to_string()).or_default();

        if record.finalized {
            return Err(StorageError::InvalidOperation("cannot append to finalized blob".into()));
        }
        if chunk_number as usize != record.chunks.len() + 1 {
            return Err(StorageError::InvalidOperation(format!(
                "expected chunk #{}, got chunk #{}",
                record.chunks.len() + 1,
                chunk_number
            )));
        }
        record.chunks.push(buf);
        Ok(())
    }

    async fn finalize_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_count: u32,
    ) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        let record = accounts
            .get_mut(account_name)
            .and_then(|space| space.blobs.get_mut(storage_id))
            .ok_or(StorageError::NotFound)?;
        if record.chunks.len() != chunk_count as usize {
            return Err(StorageError::InvalidOperation(format!(
                "finalize with {} chunks, but {} were appended",
                chunk_count,
                record.chunks.len()
            )));
        }
        record.finalized = true;
        Ok(())
    }

    async fn abort_blob_upload(
        &self,
        account_name: &str,
        storage_id: &str,
        _chunk_count: u32,
    ) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        let space = accounts.get_mut(account_name).ok_or(StorageError::NotFound)?;
        match space.blobs.get(storage_id) {
            Some(record) if record.finalized => {
                Err(StorageError::InvalidOperation("cannot abort finalized blob".into()))
            }
            Some(_) => {
                space.blobs.remove(storage_id);
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn read_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<(BlobReader, u64), StorageError> {
        let accounts = self.accounts.read().unwrap();
        let record = accounts
            .get(account_name)
            .and_then(|space| space.blobs.get(storage_id))
            .ok_or(StorageError::NotFound)?;
        let contents: Vec<u8> = record.chunks.concat();
        let size = contents.len() as u64;
        Ok((Box::new(Cursor::new(contents)), size))
    }

    async fn url_for_blob(
        &self,
        _account_name: &str,
        _storage_id: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        let space = accounts.get_mut(account_name).ok_or(StorageError::NotFound)?;
        space.blobs.remove(storage_id).map(|_| ()).ok_or(StorageError::NotFound)
    }

    async fn read_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Vec<u8>, StorageError> {
        let accounts = self.accounts.read().unwrap();
        accounts
            .get(account_name)
            .and_then(|space| space.manifests.get(&(repo_name.to_string(), digest.to_string())))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn write_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        let space = accounts.entry(account_name.to_string()).or_default();
        space
            .manifests
            .insert((repo_name.to_string(), digest.to_string()), contents.to_vec());
        Ok(())
    }

    async fn delete_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        let space = accounts.get_mut(account_name).ok_or(StorageError::NotFound)?;
        space
            .manifests
            .remove(&(repo_name.to_string(), digest.to_string()))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn read_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<Vec<u8>, StorageError> {
        let accounts = self.accounts.read().unwrap();
        accounts
            .get(account_name)
            .and_then(|space| {
                space
                    .scan_reports
                    .get(&(repo_name.to_string(), digest.to_string(), format.to_string()))
            })
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn write_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        let space = accounts.entry(account_name.to_string()).or_default();
        space.scan_reports.insert(
            (repo_name.to_string(), digest.to_string(), format.to_string()),
            contents.to_vec(),
        );
        Ok(())
    }

    async fn delete_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        if let Some(space) = accounts.get_mut(account_name) {
            space
                .scan_reports
                .remove(&(repo_name.to_string(), digest.to_string(), format.to_string()));
        }
        Ok(())
    }

    async fn list_storage_contents(&self, account_name: &str) -> Result<StorageContents, StorageError> {
        let accounts = self.accounts.read().unwrap();
        let Some(space) = accounts.get(account_name) else {
            return Ok(StorageContents::default());
        };
        Ok(StorageContents {
            blobs: space
                .blobs
                .iter()
                .map(|(storage_id, record)| StoredBlobInfo {
                    storage_id: storage_id.clone(),
                    chunk_count: record.chunks.len() as u32,
                })
                .collect(),
            manifests: space
                .manifests
                .keys()
                .map(|(repo_name, digest)| StoredManifestInfo {
                    repo_name: repo_name.clone(),
                    digest: digest.clone(),
                })
                .collect(),
        })
    }

    async fn can_setup_account(&self, _account_name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn cleanup_account(&self, account_name: &str) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().unwrap();
        if let Some(space) = accounts.get(account_name) {
            let remaining = space.blobs.len() + space.manifests.len();
            if remaining > 0 {
                return Err(StorageError::AccountNotEmpty(remaining as u64));
            }
            accounts.remove(account_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    async fn append(driver: &InMemoryDriver, account: &str, sid: &str, n: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut cursor = Cursor::new(data.to_vec());
        driver.append_to_blob(account, sid, n, Some(data.len() as u64), &mut cursor).await
    }

    #[tokio::test]
    async fn test_chunked_write_and_read() {
        let driver = InMemoryDriver::new();
        append(&driver, "acc", "sid1", 1, b"hello ").await.unwrap();
        append(&driver, "acc", "sid1", 2, b"world").await.unwrap();
        driver.finalize_blob("acc", "sid1", 2).await.unwrap();

        let (mut reader, size) = driver.read_blob("acc", "sid1").await.unwrap();
        assert_eq!(size, 11);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn test_chunk_ordering_enforced() {
        let driver = InMemoryDriver::new();
        append(&driver, "acc", "sid1", 1, b"a").await.unwrap();
        let err = append(&driver, "acc", "sid1", 3, b"c").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_append_after_finalize_fails() {
        let driver = InMemoryDriver::new();
        append(&driver, "acc", "sid1", 1, b"a").await.unwrap();
        driver.finalize_blob("acc", "sid1", 1).await.unwrap();
        let err = append(&driver, "acc", "sid1", 2, b"b").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));

        // abort must also refuse finalized blobs
        let err = driver.abort_blob_upload("acc", "sid1", 1).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_cleanup_refuses_nonempty_account() {
        let driver = InMemoryDriver::new();
        driver.write_manifest("acc", "repo", "sha256:abc", b"{}").await.unwrap();
        let err = driver.cleanup_account("acc").await.unwrap_err();
        assert!(matches!(err, StorageError::AccountNotEmpty(1)));

        driver.delete_manifest("acc", "repo", "sha256:abc").await.unwrap();
        driver.cleanup_account("acc").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_storage_contents() {
        let driver = InMemoryDriver::new();
        append(&driver, "acc", "sid1", 1, b"a").await.unwrap();
        driver.write_manifest("acc", "repo", "sha256:abc", b"{}").await.unwrap();

        let contents = driver.list_storage_contents("acc").await.unwrap();
        assert_eq!(contents.blobs.len(), 1);
        assert_eq!(contents.blobs[0].storage_id, "sid1");
        assert_eq!(contents.manifests.len(), 1);

        // unknown accounts report empty contents rather than an error
        assert!(driver.list_storage_contents("other").await.unwrap().blobs.is_empty());
    }
}
