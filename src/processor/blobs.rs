//! Blob ingestion: chunked uploads, finalization, and replication on pull.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error};

use super::Processor;
use crate::db::{self, Account, Blob, Repo, BLOB_VALIDATION_INTERVAL_SECS, PENDING_REASON_REPLICATION};
use crate::drivers::storage::generate_storage_id;
use crate::errors::RegistryV2Error;
use crate::metrics;
use crate::oci::Digest;
use crate::util::{tee_reader, ChannelReader, CountingReader, HashingReader};

/// Uploads are split into chunks of at most this size before they reach the
/// storage driver, regardless of how the client chunked its request bodies.
/// Storage backends commonly refuse single writes beyond a size like this.
pub const CHUNK_SIZE_BYTES: u64 = 500 << 20; // 500 MiB

/// Mutable bookkeeping for an upload in progress; mirrored into the
/// `uploads` row for client-driven chunked uploads.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub storage_id: String,
    pub size_bytes: u64,
    pub num_chunks: u32,
}

impl UploadProgress {
    pub fn new() -> Self {
        UploadProgress {
            storage_id: generate_storage_id(),
            size_bytes: 0,
            num_chunks: 0,
        }
    }
}

impl Default for UploadProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// The client-facing half of a blob replication: response metadata plus the
/// byte stream, which flows while the storage upload proceeds concurrently.
pub struct ReplicatedBlob {
    pub digest: Digest,
    pub media_type: String,
    pub size_bytes: u64,
    pub body: ChannelReader,
}

impl Processor {
    /// Appends bytes to a blob upload, splitting them into storage-sized
    /// chunks, and updates the progress accordingly.
    ///
    /// The storage append action runs at least once even for empty input, so
    /// that zero-byte blobs still materialize in the backend.
    pub async fn append_to_blob<R>(
        &self,
        account_name: &str,
        progress: &mut UploadProgress,
        mut reader: R,
        length: Option<u64>,
    ) -> Result<(), RegistryV2Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        // case 1: known input length, chunk boundaries can be computed
        if let Some(total) = length {
            let mut remaining = total;
            loop {
                let chunk_length = remaining.min(CHUNK_SIZE_BYTES);
                progress.num_chunks += 1;
                progress.size_bytes += chunk_length;
                let mut chunk = (&mut reader).take(chunk_length);
                self.sd
                    .append_to_blob(
                        account_name,
                        &progress.storage_id,
                        progress.num_chunks,
                        Some(chunk_length),
                        &mut chunk,
                    )
                    .await
                    .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;
                remaining -= chunk_length;
                if remaining == 0 {
                    break;
                }
            }
            return Ok(());
        }

        // case 2: unknown input length; a one-byte read-ahead detects EOF so
        // that a full final chunk is not followed by a spurious empty one
        let mut peeked: Option<u8> = None;
        loop {
            progress.num_chunks += 1;
            let prefix: Vec<u8> = peeked.take().into_iter().collect();
            let prefix_len = prefix.len() as u64;
            let chunk = AsyncReadExt::chain(
                std::io::Cursor::new(prefix),
                (&mut reader).take(CHUNK_SIZE_BYTES - prefix_len),
            );
            let mut counting = CountingReader::new(chunk);
            self.sd
                .append_to_blob(
                    account_name,
                    &progress.storage_id,
                    progress.num_chunks,
                    None,
                    &mut counting,
                )
                .await
                .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;
            let appended = counting.bytes_read();
            progress.size_bytes += appended;

            if appended < CHUNK_SIZE_BYTES {
                break;
            }
            let mut probe = [0u8; 1];
            if reader.read(&mut probe).await? == 0 {
                break;
            }
            peeked = Some(probe[0]);
        }
        Ok(())
    }

    /// Streams the given bytes into storage as a fresh blob and upgrades the
    /// blob row (which may be unbacked) to point at it. Cleans up the storage
    /// side on any failure.
    pub(crate) async fn upload_blob_to_local<R>(
        &self,
        blob: &Blob,
        reader: R,
        length: u64,
    ) -> Result<(), RegistryV2Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result = self.try_upload_blob_to_local(blob, reader, length).await;
        if result.is_err() {
            metrics::UPLOADS_ABORTED
                .with_label_values(&[&blob.account_name, "replication"])
                .inc();
        }
        result
    }

    async fn try_upload_blob_to_local<R>(
        &self,
        blob: &Blob,
        reader: R,
        length: u64,
    ) -> Result<(), RegistryV2Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut progress = UploadProgress::new();

        if let Err(err) = self
            .append_to_blob(&blob.account_name, &mut progress, reader, Some(length))
            .await
        {
            self.abort_upload_logged(&blob.account_name, &progress).await;
            return Err(err);
        }
        if let Err(err) = self
            .sd
            .finalize_blob(&blob.account_name, &progress.storage_id, progress.num_chunks)
            .await
        {
            self.abort_upload_logged(&blob.account_name, &progress).await;
            return Err(RegistryV2Error::Internal(err.to_string()));
        }

        let now = self.now();
        let update = sqlx::query(
            "UPDATE blobs SET storage_id = $1, size_bytes = $2, pushed_at = $3, next_validation_at = $4
              WHERE id = $5",
        )
        .bind(&progress.storage_id)
        .bind(length as i64)
        .bind(now)
        .bind(now + BLOB_VALIDATION_INTERVAL_SECS)
        .bind(blob.id)
        .execute(&self.db)
        .await;

        if let Err(err) = update {
            // the DB row still points nowhere; reclaim the fresh storage object
            if let Err(delete_err) = self.sd.delete_blob(&blob.account_name, &progress.storage_id).await {
                error!(
                    "additional error while deleting blob {} from account {} after upload error: {}",
                    progress.storage_id, blob.account_name, delete_err
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    async fn abort_upload_logged(&self, account_name: &str, progress: &UploadProgress) {
        if let Err(err) = self
            .sd
            .abort_blob_upload(account_name, &progress.storage_id, progress.num_chunks)
            .await
        {
            error!(
                "additional error while aborting upload {} in account {}: {}",
                progress.storage_id, account_name, err
            );
        }
    }

    /// Records a finished upload as a blob and mounts it into the repo. The
    /// storage side must already be finalized. If a backed blob with this
    /// digest already exists in the account, the freshly uploaded copy is
    /// discarded in favor of the existing one.
    pub async fn commit_uploaded_blob(
        &self,
        account: &Account,
        repo: &Repo,
        digest: &Digest,
        progress: &UploadProgress,
        media_type: &str,
    ) -> Result<Blob, RegistryV2Error> {
        if account.is_deleting {
            return Err(RegistryV2Error::Denied("account is being deleted".into()));
        }

        let now = self.now();
        let digest_str = digest.to_string();
        let existing = db::find_blob(&self.db, &account.name, &digest_str).await?;

        let blob = match existing {
            Some(blob) if !blob.is_unbacked() => {
                if let Err(err) = self.sd.delete_blob(&account.name, &progress.storage_id).await {
                    error!(
                        "cannot delete duplicate upload {} in account {}: {}",
                        progress.storage_id, account.name, err
                    );
                }
                blob
            }
            Some(blob) => {
                // upgrade an unbacked blob left behind by manifest replication
                sqlx::query(
                    "UPDATE blobs SET storage_id = $1, size_bytes = $2, media_type = $3,
                            pushed_at = $4, next_validation_at = $5, can_be_deleted_at = NULL
                      WHERE id = $6",
                )
                .bind(&progress.storage_id)
                .bind(progress.size_bytes as i64)
                .bind(media_type)
                .bind(now)
                .bind(now + BLOB_VALIDATION_INTERVAL_SECS)
                .bind(blob.id)
                .execute(&self.db)
                .await?;
                db::find_blob(&self.db, &account.name, &digest_str)
                    .await?
                    .ok_or_else(|| RegistryV2Error::Internal("blob row vanished".into()))?
            }
            None => {
                sqlx::query(
                    "INSERT INTO blobs (account_name, digest, size_bytes, storage_id, media_type, pushed_at, next_validation_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(&account.name)
                .bind(&digest_str)
                .bind(progress.size_bytes as i64)
                .bind(&progress.storage_id)
                .bind(media_type)
                .bind(now)
                .bind(now + BLOB_VALIDATION_INTERVAL_SECS)
                .execute(&self.db)
                .await?;
                db::find_blob(&self.db, &account.name, &digest_str)
                    .await?
                    .ok_or_else(|| RegistryV2Error::Internal("blob row vanished".into()))?
            }
        };

        db::mount_blob(&self.db, blob.id, repo.id).await?;
        metrics::BLOBS_PUSHED
            .with_label_values(&[&account.name, "registry-api"])
            .inc();
        Ok(blob)
    }

    /// Looks up a blob referenced by a manifest that is being replicated. If
    /// no row exists yet, an unbacked one is inserted; the blob bytes follow
    /// lazily when the blob is first pulled.
    pub async fn find_blob_or_insert_unbacked(
        &self,
        account_name: &str,
        digest: &Digest,
        media_type: &str,
        size_bytes: u64,
    ) -> Result<Blob, RegistryV2Error> {
        if let Some(blob) = db::find_blob(&self.db, account_name, &digest.to_string()).await? {
            return Ok(blob);
        }

        sqlx::query(
            "INSERT INTO blobs (account_name, digest, size_bytes, storage_id, media_type, pushed_at, next_validation_at)
             VALUES ($1, $2, $3, '', $4, 0, 0)
             ON CONFLICT (account_name, digest) DO NOTHING",
        )
        .bind(account_name)
        .bind(digest.to_string())
        .bind(size_bytes as i64)
        .bind(media_type)
        .execute(&self.db)
        .await?;

        db::find_blob(&self.db, account_name, &digest.to_string())
            .await?
            .ok_or_else(|| RegistryV2Error::Internal("blob row vanished during insert".into()))
    }

    /// Replicates a blob from the account's upstream registry. The returned
    /// stream feeds the client while a background task persists the same
    /// bytes via the chunked upload path. At most one replication per
    /// (account, digest) runs at a time; concurrent callers get
    /// `CurrentlyReplicating` and must retry.
    pub async fn replicate_blob(
        &self,
        blob: Blob,
        account: &Account,
        repo: &Repo,
    ) -> Result<ReplicatedBlob, RegistryV2Error> {
        let now = self.now();
        let insert = sqlx::query(
            "INSERT INTO pending_blobs (account_name, digest, reason, pending_since) VALUES ($1, $2, $3, $4)",
        )
        .bind(&blob.account_name)
        .bind(&blob.digest)
        .bind(PENDING_REASON_REPLICATION)
        .bind(now)
        .execute(&self.db)
        .await;

        if let Err(insert_err) = insert {
            // duplicate key means another worker is already on it
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM pending_blobs WHERE account_name = $1 AND digest = $2")
                    .bind(&blob.account_name)
                    .bind(&blob.digest)
                    .fetch_one(&self.db)
                    .await?;
            if count > 0 {
                return Err(RegistryV2Error::CurrentlyReplicating);
            }
            return Err(insert_err.into());
        }

        match self.start_blob_replication(&blob, account, repo).await {
            Ok(replicated) => Ok(replicated),
            Err(err) => {
                // unblock other pullers waiting for this replication
                self.delete_pending_blob(&blob).await;
                Err(err)
            }
        }
    }

    async fn start_blob_replication(
        &self,
        blob: &Blob,
        account: &Account,
        repo: &Repo,
    ) -> Result<ReplicatedBlob, RegistryV2Error> {
        let digest = blob.parsed_digest()?;
        let client = self.repo_client_for_upstream(account, repo).await?;
        let (upstream_reader, length) = client.download_blob(&digest).await?;

        let (client_reader, storage_reader) = tee_reader(upstream_reader, 64 * 1024, 8);

        let this = self.clone();
        let blob_for_task = blob.clone();
        tokio::spawn(async move {
            match this.upload_blob_to_local(&blob_for_task, storage_reader, length).await {
                Ok(()) => {
                    metrics::BLOBS_PUSHED
                        .with_label_values(&[&blob_for_task.account_name, "replication"])
                        .inc();
                    debug!(
                        "replicated blob {} into account {}",
                        blob_for_task.digest, blob_for_task.account_name
                    );
                }
                Err(err) => {
                    error!(
                        "replication of blob {} into account {} failed: {}",
                        blob_for_task.digest, blob_for_task.account_name, err
                    );
                }
            }
            // success or failure, unblock waiting pullers
            this.delete_pending_blob(&blob_for_task).await;
        });

        Ok(ReplicatedBlob {
            digest,
            // the media type is known because a referencing manifest was
            // already replicated
            media_type: blob.safe_media_type().to_string(),
            size_bytes: length,
            body: client_reader,
        })
    }

    async fn delete_pending_blob(&self, blob: &Blob) {
        let result = sqlx::query("DELETE FROM pending_blobs WHERE account_name = $1 AND digest = $2")
            .bind(&blob.account_name)
            .bind(&blob.digest)
            .execute(&self.db)
            .await;
        if let Err(err) = result {
            error!(
                "cannot remove pending-blob marker for {} in account {}: {}",
                blob.digest, blob.account_name, err
            );
        }
    }

    /// Re-reads a backed blob from storage and verifies digest and size.
    /// Returns the validation failure as a message suitable for the blob
    /// row's `validation_error_message`.
    pub async fn validate_existing_blob(&self, blob: &Blob) -> Result<(), String> {
        let expected_digest = blob.parsed_digest().map_err(|err| err.to_string())?;

        let (reader, _) = self
            .sd
            .read_blob(&blob.account_name, &blob.storage_id)
            .await
            .map_err(|err| err.to_string())?;

        let mut counting = CountingReader::new(HashingReader::new(reader));
        let mut sink = tokio::io::sink();
        tokio::io::copy(&mut counting, &mut sink)
            .await
            .map_err(|err| err.to_string())?;

        let actual_size = counting.bytes_read();
        let actual_digest = counting.into_inner().digest();

        if actual_digest != expected_digest {
            return Err(format!("expected digest {expected_digest}, but got {actual_digest}"));
        }
        if actual_size != blob.size_bytes as u64 {
            return Err(format!("expected {} bytes, but got {} bytes", blob.size_bytes, actual_size));
        }
        Ok(())
    }
}
