//! Filesystem storage driver: one directory tree per account. Chunks are
//! written as numbered files and concatenated into a single `contents` file
//! on finalize, so reads can stream from one file handle.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::{
    BlobReader, StorageContents, StorageDriver, StorageError, StoredBlobInfo, StoredManifestInfo,
};

pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemDriver { root: root.into() }
    }

    fn blob_dir(&self, account_name: &str, storage_id: &str) -> PathBuf {
        self.root.join(account_name).join("blobs").join(storage_id)
    }

    fn contents_path(&self, account_name: &str, storage_id: &str) -> PathBuf {
        self.blob_dir(account_name, storage_id).join("contents")
    }

    fn chunk_path(&self, account_name: &str, storage_id: &str, chunk_number: u32) -> PathBuf {
        self.blob_dir(account_name, storage_id).join(format!("chunk-{chunk_number:06}"))
    }

    fn manifest_path(&self, account_name: &str, repo_name: &str, digest: &str) -> PathBuf {
        self.root.join(account_name).join("manifests").join(repo_name).join(digest)
    }

    fn scan_report_path(&self, account_name: &str, repo_name: &str, digest: &str, format: &str) -> PathBuf {
        self.root
            .join(account_name)
            .join("reports")
            .join(repo_name)
            .join(format!("{digest}.{format}"))
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, contents).await?;
    Ok(())
}

/// Collects all regular files below `root`, returning paths relative to it.
async fn walk_files(root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut result = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                result.push(relative.to_path_buf());
            }
        }
    }
    Ok(result)
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    fn plugin_type_id(&self) -> &'static str {
        "filesystem"
    }

    async fn append_to_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_number: u32,
        _chunk_length: Option<u64>,
        chunk: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), StorageError> {
        if fs::try_exists(self.contents_path(account_name, storage_id)).await? {
            return Err(StorageError::InvalidOperation("cannot append to finalized blob".into()));
        }
        let dir = self.blob_dir(account_name, storage_id);
        fs::create_dir_all(&dir).await?;

        if chunk_number > 1 {
            let previous = self.chunk_path(account_name, storage_id, chunk_number - 1);
            if !fs::try_exists(&previous).await? {
                return Err(StorageError::InvalidOperation(format!(
                    "chunk #{chunk_number} appended, but chunk #{} is missing",
                    chunk_number - 1
                )));
            }
        }

        let path = self.chunk_path(account_name, storage_id, chunk_number);
        let mut file = fs::File::create(&path).await?;
        tokio::io::copy(chunk, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_count: u32,
    ) -> Result<(), StorageError> {
        let contents_path = self.contents_path(account_name, storage_id);
        if fs::try_exists(&contents_path).await? {
            return Ok(());
        }

        let temp_path = self.blob_dir(account_name, storage_id).join("contents.partial");
        let mut dest = fs::File::create(&temp_path).await?;
        for chunk_number in 1..=chunk_count {
            let chunk_path = self.chunk_path(account_name, storage_id, chunk_number);
            let mut src = fs::File::open(&chunk_path).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    StorageError::InvalidOperation(format!("finalize is missing chunk #{chunk_number}"))
                } else {
                    err.into()
                }
            })?;
            tokio::io::copy(&mut src, &mut dest).await?;
        }
        dest.flush().await?;
        fs::rename(&temp_path, &contents_path).await?;

        for chunk_number in 1..=chunk_count {
            let _ = fs::remove_file(self.chunk_path(account_name, storage_id, chunk_number)).await;
        }
        Ok(())
    }

    async fn abort_blob_upload(
        &self,
        account_name: &str,
        storage_id: &str,
        _chunk_count: u32,
    ) -> Result<(), StorageError> {
        if fs::try_exists(self.contents_path(account_name, storage_id)).await? {
            return Err(StorageError::InvalidOperation("cannot abort finalized blob".into()));
        }
        let dir = self.blob_dir(account_name, storage_id);
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound);
        }
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn read_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<(BlobReader, u64), StorageError> {
        let path = self.contents_path(account_name, storage_id);
        let file = fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok((Box::new(file), size))
    }

    async fn url_for_blob(
        &self,
        _account_name: &str,
        _storage_id: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<(), StorageError> {
        let dir = self.blob_dir(account_name, storage_id);
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound);
        }
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn read_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.manifest_path(account_name, repo_name, digest)).await?)
    }

    async fn write_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        write_file(&self.manifest_path(account_name, repo_name, digest), contents).await
    }

    async fn delete_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), StorageError> {
        fs::remove_file(self.manifest_path(account_name, repo_name, digest)).await?;
        Ok(())
    }

    async fn read_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.scan_report_path(account_name, repo_name, digest, format)).await?)
    }

    async fn write_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        write_file(&self.scan_report_path(account_name, repo_name, digest, format), contents).await
    }

    async fn delete_scan_report(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<(), StorageError> {
        match fs::remove_file(self.scan_report_path(account_name, repo_name, digest, format)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_storage_contents(&self, account_name: &str) -> Result<StorageContents, StorageError> {
        let mut contents = StorageContents::default();

        let blobs_root = self.root.join(account_name).join("blobs");
        let mut entries = match fs::read_dir(&blobs_root).await {
            Ok(entries) => Some(entries),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if let Some(entries) = entries.as_mut() {
            while let Some(entry) = entries.next_entry().await? {
                let storage_id = entry.file_name().to_string_lossy().to_string();
                let files = walk_files(&entry.path()).await?;
                let chunk_count = files
                    .iter()
                    .filter(|f| f.to_string_lossy().starts_with("chunk-"))
                    .count() as u32;
                contents.blobs.push(StoredBlobInfo { storage_id, chunk_count });
            }
        }

        let manifests_root = self.root.join(account_name).join("manifests");
        for relative in walk_files(&manifests_root).await? {
            let path_str = relative.to_string_lossy().replace('\\', "/");
            if let Some((repo_name, digest)) = path_str.rsplit_once('/') {
                contents.manifests.push(StoredManifestInfo {
                    repo_name: repo_name.to_string(),
                    digest: digest.to_string(),
                });
            }
        }

        Ok(contents)
    }

    async fn can_setup_account(&self, account_name: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.root.join(account_name)).await?;
        Ok(())
    }

    async fn cleanup_account(&self, account_name: &str) -> Result<(), StorageError> {
        let account_root = self.root.join(account_name);
        if !fs::try_exists(&account_root).await? {
            return Ok(());
        }

        let mut remaining = 0u64;
        for subdir in ["blobs", "manifests"] {
            remaining += walk_files(&account_root.join(subdir)).await?.len() as u64;
        }
        if remaining > 0 {
            return Err(StorageError::AccountNotEmpty(remaining));
        }
        fs::remove_dir_all(&account_root).await?;
        Ok(())
    }
}
