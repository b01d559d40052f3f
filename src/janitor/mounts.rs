//! Blob-mount sweep: per repo, mark-and-sweep blob mounts whose blob is not
//! referenced by any manifest in the repo.

use tracing::debug;

use super::{Janitor, JobResult, BLOB_MOUNT_SWEEP_INTERVAL_SECS};
use crate::db::{Repo, MARK_AND_SWEEP_GRACE_SECS};
use crate::errors::RegistryV2Error;

impl Janitor {
    pub(crate) async fn sweep_blob_mounts_next(&self) -> Result<JobResult, RegistryV2Error> {
        let now = self.now();
        let repo: Option<Repo> = sqlx::query_as(
            "SELECT * FROM repos
              WHERE next_blob_mount_sweep_at IS NULL OR next_blob_mount_sweep_at < $1
              ORDER BY next_blob_mount_sweep_at IS NULL DESC, next_blob_mount_sweep_at ASC
              LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        let Some(repo) = repo else {
            return Ok(JobResult::NothingToDo);
        };

        // a manifest that currently fails validation may be missing its
        // reference rows; sweeping mounts now could tear the blobs out from
        // under it, so the whole repo is skipped until validation recovers
        let (broken_manifests,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM manifests WHERE repo_id = $1 AND validation_error_message != ''",
        )
        .bind(repo.id)
        .fetch_one(&self.db)
        .await?;

        if broken_manifests == 0 {
            // unmark mounts whose blob has regained a reference
            sqlx::query(
                "UPDATE blob_mounts SET can_be_deleted_at = NULL
                  WHERE repo_id = $1 AND can_be_deleted_at IS NOT NULL
                    AND blob_id IN (SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1)",
            )
            .bind(repo.id)
            .execute(&self.db)
            .await?;

            // mark unreferenced mounts
            sqlx::query(
                "UPDATE blob_mounts SET can_be_deleted_at = $2
                  WHERE repo_id = $1 AND can_be_deleted_at IS NULL
                    AND blob_id NOT IN (SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1)",
            )
            .bind(repo.id)
            .bind(now + MARK_AND_SWEEP_GRACE_SECS)
            .execute(&self.db)
            .await?;

            // sweep mounts whose marker has come due and that are still
            // unreferenced
            let swept = sqlx::query(
                "DELETE FROM blob_mounts
                  WHERE repo_id = $1 AND can_be_deleted_at < $2
                    AND blob_id NOT IN (SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1)",
            )
            .bind(repo.id)
            .bind(now)
            .execute(&self.db)
            .await?;
            if swept.rows_affected() > 0 {
                debug!("swept {} blob mounts from repo {}", swept.rows_affected(), repo.full_name());
            }
        } else {
            debug!(
                "skipping blob-mount sweep in repo {}: {} manifests are failing validation",
                repo.full_name(),
                broken_manifests
            );
        }

        sqlx::query("UPDATE repos SET next_blob_mount_sweep_at = $2 WHERE id = $1")
            .bind(repo.id)
            .bind(self.next_run(BLOB_MOUNT_SWEEP_INTERVAL_SECS))
            .execute(&self.db)
            .await?;

        Ok(JobResult::DidWork)
    }
}
