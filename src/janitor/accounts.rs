//! Account-level jobs: federation announcements and the deletion state
//! machine for accounts marked `is_deleting`.

use tracing::{error, info};

use super::{Janitor, JobResult, ACCOUNT_DELETION_RETRY_SECS, FEDERATION_ANNOUNCEMENT_INTERVAL_SECS};
use crate::db::{self, Account};
use crate::errors::RegistryV2Error;

impl Janitor {
    /// Announces one due account to the federation driver, repairing drift in
    /// the shared claim state.
    pub(crate) async fn announce_next_account(&self) -> Result<JobResult, RegistryV2Error> {
        let account: Option<Account> = sqlx::query_as(
            "SELECT * FROM accounts
              WHERE next_federation_announcement_at IS NULL OR next_federation_announcement_at < $1
              ORDER BY next_federation_announcement_at IS NULL DESC, next_federation_announcement_at ASC
              LIMIT 1",
        )
        .bind(self.now())
        .fetch_optional(&self.db)
        .await?;
        let Some(account) = account else {
            return Ok(JobResult::NothingToDo);
        };

        if let Err(err) = self.fd.record_existing_account(&account, self.now()).await {
            // the announcement is not critical for day-to-day operation, so
            // a failure is logged and the clock re-armed regardless
            error!("cannot announce account {:?} to federation: {err}", account.name);
        }

        sqlx::query("UPDATE accounts SET next_federation_announcement_at = $2 WHERE name = $1")
            .bind(&account.name)
            .bind(self.next_run(FEDERATION_ANNOUNCEMENT_INTERVAL_SECS))
            .execute(&self.db)
            .await?;

        Ok(JobResult::DidWork)
    }

    /// Advances the deletion of one account marked `is_deleting`:
    /// 1. delete root manifests, recursing while progress is made,
    /// 2. delete all repos (cascading blob mounts),
    /// 3. wait for the blob sweep to reclaim remaining blobs,
    /// 4. delete the account row together with its storage namespace and
    ///    federation claim.
    pub(crate) async fn delete_next_marked_account(&self) -> Result<JobResult, RegistryV2Error> {
        let account_name: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM accounts
              WHERE is_deleting AND next_deletion_attempt_at < $1
              ORDER BY next_deletion_attempt_at ASC, name ASC
              LIMIT 1",
        )
        .bind(self.now())
        .fetch_optional(&self.db)
        .await?;
        let Some((account_name,)) = account_name else {
            return Ok(JobResult::NothingToDo);
        };

        let Some(account) = db::find_account(&self.db, &account_name).await? else {
            // someone else finished the deletion already
            return Ok(JobResult::DidWork);
        };

        self.try_delete_marked_account(&account).await?;
        Ok(JobResult::DidWork)
    }

    async fn try_delete_marked_account(&self, account: &Account) -> Result<(), RegistryV2Error> {
        // manifests must go before repos; only root manifests (not referenced
        // by any parent) are deletable, so deleting them level by level
        // unlocks the next level
        loop {
            let root_manifests: Vec<(String, String)> = sqlx::query_as(
                "SELECT r.name, m.digest
                   FROM manifests m
                   JOIN repos r ON m.repo_id = r.id
                   LEFT OUTER JOIN manifest_manifest_refs mmr
                     ON mmr.repo_id = r.id AND mmr.child_digest = m.digest
                  WHERE r.account_name = $1 AND mmr.parent_digest IS NULL",
            )
            .bind(&account.name)
            .fetch_all(&self.db)
            .await?;

            let mut deleted_manifest_count = 0usize;
            for (repo_name, digest_str) in root_manifests {
                let repo = db::find_repo(&self.db, &account.name, &repo_name)
                    .await?
                    .ok_or_else(|| {
                        RegistryV2Error::Internal(format!(
                            "while deleting manifest {digest_str:?} in repository {repo_name:?}: repository vanished"
                        ))
                    })?;
                let digest = digest_str.parse().map_err(|_| {
                    RegistryV2Error::Internal(format!("manifest row carries invalid digest {digest_str:?}"))
                })?;
                self.processor.delete_manifest(account, &repo, &digest).await.map_err(|err| {
                    RegistryV2Error::Internal(format!(
                        "while deleting manifest {digest_str:?} in repository {repo_name:?}: {err}"
                    ))
                })?;
                deleted_manifest_count += 1;
            }

            let (remaining,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM manifests m JOIN repos r ON m.repo_id = r.id WHERE r.account_name = $1",
            )
            .bind(&account.name)
            .fetch_one(&self.db)
            .await?;
            if remaining == 0 {
                break;
            }
            if deleted_manifest_count == 0 {
                return Err(RegistryV2Error::Internal(format!(
                    "cannot make progress on deleting account {:?}: {remaining} manifests remain, but none are ready to delete",
                    account.name
                )));
            }
            // deleting the roots made higher-layer manifests deletable
        }

        // delete all repos (and thereby all blob mounts), so that the blob
        // sweep can reclaim everything
        sqlx::query("DELETE FROM repos WHERE account_name = $1")
            .bind(&account.name)
            .execute(&self.db)
            .await?;

        let (blob_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE account_name = $1")
            .bind(&account.name)
            .fetch_one(&self.db)
            .await?;
        if blob_count > 0 {
            let now = self.now();
            // make the blob sweep run immediately; an earlier marker wins
            sqlx::query(
                "UPDATE blobs SET can_be_deleted_at = MIN(COALESCE(can_be_deleted_at, $2), $2)
                  WHERE account_name = $1",
            )
            .bind(&account.name)
            .bind(now)
            .execute(&self.db)
            .await?;
            sqlx::query("UPDATE accounts SET next_blob_sweep_at = $2 WHERE name = $1")
                .bind(&account.name)
                .bind(now)
                .execute(&self.db)
                .await?;
            sqlx::query("UPDATE accounts SET next_deletion_attempt_at = $2 WHERE name = $1")
                .bind(&account.name)
                .bind(now + ACCOUNT_DELETION_RETRY_SECS)
                .execute(&self.db)
                .await?;
            info!(
                "cleaning up account {:?}: waiting for {blob_count} blobs to be deleted",
                account.name
            );
            return Ok(());
        }

        // nothing left: drop the row, the storage namespace and the name
        // claim together
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM accounts WHERE name = $1")
            .bind(&account.name)
            .execute(&mut *tx)
            .await?;

        // confirm with the storage and federation drivers before committing
        self.sd
            .cleanup_account(&account.name)
            .await
            .map_err(|err| RegistryV2Error::Internal(format!("while cleaning up storage for account: {err}")))?;
        self.fd
            .forfeit_account_name(account)
            .await
            .map_err(|err| RegistryV2Error::Internal(format!("while cleaning up name claim for account: {err}")))?;

        tx.commit().await?;
        info!("account {:?} deleted", account.name);
        Ok(())
    }
}
