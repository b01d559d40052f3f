//! Blob validation (digest recomputation) and the account-level blob sweep.
//! The sweep marker `can_be_deleted_at` holds the time from which deletion is
//! allowed; marking keeps the earliest marker so that re-marking can never
//! postpone a deletion.

use tracing::{debug, info};

use super::{Janitor, JobResult, BLOB_SWEEP_INTERVAL_SECS};
use crate::db::{
    Blob, BLOB_VALIDATION_INTERVAL_SECS, MARK_AND_SWEEP_GRACE_SECS, VALIDATION_RETRY_INTERVAL_SECS,
};
use crate::errors::RegistryV2Error;

impl Janitor {
    /// Re-reads one due blob from storage and verifies digest and size.
    pub(crate) async fn validate_next_blob(&self) -> Result<JobResult, RegistryV2Error> {
        let blob: Option<Blob> = sqlx::query_as(
            "SELECT * FROM blobs
              WHERE next_validation_at < $1 AND storage_id != ''
              ORDER BY next_validation_at ASC
              LIMIT 1",
        )
        .bind(self.now())
        .fetch_optional(&self.db)
        .await?;
        let Some(blob) = blob else {
            return Ok(JobResult::NothingToDo);
        };

        match self.processor.validate_existing_blob(&blob).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE blobs SET validation_error_message = '', next_validation_at = $1 WHERE id = $2",
                )
                .bind(self.next_run(BLOB_VALIDATION_INTERVAL_SECS))
                .bind(blob.id)
                .execute(&self.db)
                .await?;
            }
            Err(message) => {
                sqlx::query(
                    "UPDATE blobs SET validation_error_message = $1, next_validation_at = $2 WHERE id = $3",
                )
                .bind(&message)
                .bind(self.next_run(VALIDATION_RETRY_INTERVAL_SECS))
                .bind(blob.id)
                .execute(&self.db)
                .await?;
                return Err(RegistryV2Error::Internal(format!(
                    "validation of blob {} failed: {message}",
                    blob.digest
                )));
            }
        }
        Ok(JobResult::DidWork)
    }

    /// Mark-and-sweep over the blobs of one due account: blobs with no blob
    /// mount anywhere in the account are marked, and deleted once their
    /// marker comes due on a later pass.
    pub(crate) async fn sweep_blobs_next(&self) -> Result<JobResult, RegistryV2Error> {
        let now = self.now();
        let account_name: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM accounts
              WHERE next_blob_sweep_at IS NULL OR next_blob_sweep_at < $1
              ORDER BY next_blob_sweep_at IS NULL DESC, next_blob_sweep_at ASC
              LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        let Some((account_name,)) = account_name else {
            return Ok(JobResult::NothingToDo);
        };

        // unmark blobs that have regained a mount since the last pass
        sqlx::query(
            "UPDATE blobs SET can_be_deleted_at = NULL
              WHERE account_name = $1 AND can_be_deleted_at IS NOT NULL
                AND id IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(&account_name)
        .execute(&self.db)
        .await?;

        // mark unmounted blobs; an earlier marker is never overwritten
        sqlx::query(
            "UPDATE blobs SET can_be_deleted_at = $2
              WHERE account_name = $1 AND can_be_deleted_at IS NULL
                AND id NOT IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(&account_name)
        .bind(now + MARK_AND_SWEEP_GRACE_SECS)
        .execute(&self.db)
        .await?;

        // sweep blobs whose marker has come due and that are still unmounted
        let due_blobs: Vec<Blob> = sqlx::query_as(
            "SELECT * FROM blobs
              WHERE account_name = $1 AND can_be_deleted_at < $2
                AND id NOT IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(&account_name)
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        for blob in &due_blobs {
            debug!("sweeping blob {} from account {}", blob.digest, account_name);
            if !blob.is_unbacked() {
                match self.sd.delete_blob(&account_name, &blob.storage_id).await {
                    Ok(()) | Err(crate::drivers::StorageError::NotFound) => {}
                    Err(err) => return Err(RegistryV2Error::Internal(err.to_string())),
                }
            }
            sqlx::query("DELETE FROM blobs WHERE id = $1").bind(blob.id).execute(&self.db).await?;
        }
        if !due_blobs.is_empty() {
            info!("swept {} blobs from account {}", due_blobs.len(), account_name);
        }

        sqlx::query("UPDATE accounts SET next_blob_sweep_at = $2 WHERE name = $1")
            .bind(&account_name)
            .bind(self.next_run(BLOB_SWEEP_INTERVAL_SECS))
            .execute(&self.db)
            .await?;

        Ok(JobResult::DidWork)
    }
}
