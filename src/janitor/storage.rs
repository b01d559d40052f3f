//! Storage sweep: per account, enumerate the storage backend and
//! mark-and-sweep objects that have no matching database record. This is the
//! reconciliation path for every crash window in which storage was written
//! but the database transaction never committed.

use std::collections::HashSet;
use tracing::info;

use super::{Janitor, JobResult, STORAGE_SWEEP_INTERVAL_SECS};
use crate::db::MARK_AND_SWEEP_GRACE_SECS;
use crate::drivers::StorageError;
use crate::errors::RegistryV2Error;

impl Janitor {
    pub(crate) async fn sweep_storage_next(&self) -> Result<JobResult, RegistryV2Error> {
        let now = self.now();
        let account_name: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM accounts
              WHERE next_storage_sweep_at IS NULL OR next_storage_sweep_at < $1
              ORDER BY next_storage_sweep_at IS NULL DESC, next_storage_sweep_at ASC
              LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        let Some((account_name,)) = account_name else {
            return Ok(JobResult::NothingToDo);
        };

        let contents = self
            .sd
            .list_storage_contents(&account_name)
            .await
            .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;

        // storage IDs with a database record: blobs plus uploads in flight
        let mut known_storage_ids: HashSet<String> = HashSet::new();
        let blob_rows: Vec<(String,)> =
            sqlx::query_as("SELECT storage_id FROM blobs WHERE account_name = $1 AND storage_id != ''")
                .bind(&account_name)
                .fetch_all(&self.db)
                .await?;
        known_storage_ids.extend(blob_rows.into_iter().map(|(id,)| id));
        let upload_rows: Vec<(String,)> = sqlx::query_as(
            "SELECT u.storage_id FROM uploads u JOIN repos r ON u.repo_id = r.id WHERE r.account_name = $1",
        )
        .bind(&account_name)
        .fetch_all(&self.db)
        .await?;
        known_storage_ids.extend(upload_rows.into_iter().map(|(id,)| id));

        let mut swept = 0u64;
        for stored_blob in &contents.blobs {
            if known_storage_ids.contains(&stored_blob.storage_id) {
                sqlx::query("DELETE FROM unknown_blobs WHERE account_name = $1 AND storage_id = $2")
                    .bind(&account_name)
                    .bind(&stored_blob.storage_id)
                    .execute(&self.db)
                    .await?;
                continue;
            }

            let marker: Option<(i64,)> = sqlx::query_as(
                "SELECT can_be_deleted_at FROM unknown_blobs WHERE account_name = $1 AND storage_id = $2",
            )
            .bind(&account_name)
            .bind(&stored_blob.storage_id)
            .fetch_optional(&self.db)
            .await?;

            match marker {
                None => {
                    sqlx::query(
                        "INSERT INTO unknown_blobs (account_name, storage_id, can_be_deleted_at) VALUES ($1, $2, $3)",
                    )
                    .bind(&account_name)
                    .bind(&stored_blob.storage_id)
                    .bind(now + MARK_AND_SWEEP_GRACE_SECS)
                    .execute(&self.db)
                    .await?;
                }
                Some((due,)) if due < now => {
                    // unfinalized uploads are aborted, finalized blobs deleted
                    let result = if stored_blob.chunk_count > 0 {
                        self.sd
                            .abort_blob_upload(&account_name, &stored_blob.storage_id, stored_blob.chunk_count)
                            .await
                    } else {
                        self.sd.delete_blob(&account_name, &stored_blob.storage_id).await
                    };
                    match result {
                        Ok(()) | Err(StorageError::NotFound) | Err(StorageError::InvalidOperation(_)) => {}
                        Err(err) => return Err(RegistryV2Error::Internal(err.to_string())),
                    }
                    sqlx::query("DELETE FROM unknown_blobs WHERE account_name = $1 AND storage_id = $2")
                        .bind(&account_name)
                        .bind(&stored_blob.storage_id)
                        .execute(&self.db)
                        .await?;
                    swept += 1;
                }
                Some(_) => {}
            }
        }

        for stored_manifest in &contents.manifests {
            let known: Option<(i64,)> = sqlx::query_as(
                "SELECT m.repo_id FROM manifests m JOIN repos r ON m.repo_id = r.id
                  WHERE r.account_name = $1 AND r.name = $2 AND m.digest = $3",
            )
            .bind(&account_name)
            .bind(&stored_manifest.repo_name)
            .bind(&stored_manifest.digest)
            .fetch_optional(&self.db)
            .await?;
            if known.is_some() {
                sqlx::query(
                    "DELETE FROM unknown_manifests WHERE account_name = $1 AND repo_name = $2 AND digest = $3",
                )
                .bind(&account_name)
                .bind(&stored_manifest.repo_name)
                .bind(&stored_manifest.digest)
                .execute(&self.db)
                .await?;
                continue;
            }

            let marker: Option<(i64,)> = sqlx::query_as(
                "SELECT can_be_deleted_at FROM unknown_manifests
                  WHERE account_name = $1 AND repo_name = $2 AND digest = $3",
            )
            .bind(&account_name)
            .bind(&stored_manifest.repo_name)
            .bind(&stored_manifest.digest)
            .fetch_optional(&self.db)
            .await?;

            match marker {
                None => {
                    sqlx::query(
                        "INSERT INTO unknown_manifests (account_name, repo_name, digest, can_be_deleted_at)
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(&account_name)
                    .bind(&stored_manifest.repo_name)
                    .bind(&stored_manifest.digest)
                    .bind(now + MARK_AND_SWEEP_GRACE_SECS)
                    .execute(&self.db)
                    .await?;
                }
                Some((due,)) if due < now => {
                    match self
                        .sd
                        .delete_manifest(&account_name, &stored_manifest.repo_name, &stored_manifest.digest)
                        .await
                    {
                        Ok(()) | Err(StorageError::NotFound) => {}
                        Err(err) => return Err(RegistryV2Error::Internal(err.to_string())),
                    }
                    sqlx::query(
                        "DELETE FROM unknown_manifests WHERE account_name = $1 AND repo_name = $2 AND digest = $3",
                    )
                    .bind(&account_name)
                    .bind(&stored_manifest.repo_name)
                    .bind(&stored_manifest.digest)
                    .execute(&self.db)
                    .await?;
                    swept += 1;
                }
                Some(_) => {}
            }
        }

        if swept > 0 {
            info!("storage sweep removed {swept} orphaned objects from account {account_name}");
        }

        sqlx::query("UPDATE accounts SET next_storage_sweep_at = $2 WHERE name = $1")
            .bind(&account_name)
            .bind(self.next_run(STORAGE_SWEEP_INTERVAL_SECS))
            .execute(&self.db)
            .await?;

        Ok(JobResult::DidWork)
    }
}
