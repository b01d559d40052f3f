//! Manifest validation: periodically re-parse each manifest and verify that
//! every row it references still exists.

use super::{Janitor, JobResult};
use crate::db::{
    self, Manifest, MANIFEST_VALIDATION_INTERVAL_SECS, VALIDATION_RETRY_INTERVAL_SECS,
};
use crate::errors::RegistryV2Error;
use crate::oci::ParsedManifest;

#[derive(sqlx::FromRow)]
struct ValidationCandidate {
    repo_id: i64,
    digest: String,
    account_name: String,
}

impl Janitor {
    pub(crate) async fn validate_next_manifest(&self) -> Result<JobResult, RegistryV2Error> {
        let candidate: Option<ValidationCandidate> = sqlx::query_as(
            "SELECT m.repo_id AS repo_id, m.digest AS digest, r.account_name AS account_name
               FROM manifests m JOIN repos r ON m.repo_id = r.id
              WHERE m.next_validation_at < $1
              ORDER BY m.next_validation_at ASC
              LIMIT 1",
        )
        .bind(self.now())
        .fetch_optional(&self.db)
        .await?;
        let Some(candidate) = candidate else {
            return Ok(JobResult::NothingToDo);
        };

        let Some(manifest) = db::find_manifest(&self.db, candidate.repo_id, &candidate.digest).await? else {
            return Ok(JobResult::DidWork);
        };

        match self.validate_manifest(&candidate.account_name, &manifest).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE manifests SET validation_error_message = '', next_validation_at = $1
                      WHERE repo_id = $2 AND digest = $3",
                )
                .bind(self.next_run(MANIFEST_VALIDATION_INTERVAL_SECS))
                .bind(manifest.repo_id)
                .bind(&manifest.digest)
                .execute(&self.db)
                .await?;
            }
            Err(message) => {
                sqlx::query(
                    "UPDATE manifests SET validation_error_message = $1, next_validation_at = $2
                      WHERE repo_id = $3 AND digest = $4",
                )
                .bind(&message)
                .bind(self.next_run(VALIDATION_RETRY_INTERVAL_SECS))
                .bind(manifest.repo_id)
                .bind(&manifest.digest)
                .execute(&self.db)
                .await?;
                return Err(RegistryV2Error::Internal(format!(
                    "validation of manifest {} failed: {message}",
                    manifest.digest
                )));
            }
        }
        Ok(JobResult::DidWork)
    }

    async fn validate_manifest(&self, account_name: &str, manifest: &Manifest) -> Result<(), String> {
        let contents = db::find_manifest_content(&self.db, manifest.repo_id, &manifest.digest)
            .await
            .map_err(|err| err.to_string())?
            .ok_or("manifest content is missing from the database")?;

        let parsed = ParsedManifest::parse(&manifest.media_type, &contents).map_err(|err| err.to_string())?;

        for descriptor in parsed.blob_references() {
            let blob = db::find_blob(&self.db, account_name, &descriptor.digest.to_string())
                .await
                .map_err(|err| err.to_string())?;
            let Some(blob) = blob else {
                return Err(format!("referenced blob {} does not exist", descriptor.digest));
            };
            let mounted: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM blob_mounts WHERE blob_id = $1 AND repo_id = $2",
            )
            .bind(blob.id)
            .bind(manifest.repo_id)
            .fetch_one(&self.db)
            .await
            .map_err(|err| err.to_string())?;
            if mounted.0 == 0 {
                return Err(format!(
                    "referenced blob {} is not mounted in this repo",
                    descriptor.digest
                ));
            }
        }

        let account = db::find_account(&self.db, account_name)
            .await
            .map_err(|err| err.to_string())?
            .ok_or("account does not exist")?;
        for descriptor in parsed.manifest_references(&account.platform_filter()) {
            let child = db::find_manifest(&self.db, manifest.repo_id, &descriptor.digest.to_string())
                .await
                .map_err(|err| err.to_string())?;
            if child.is_none() {
                return Err(format!("referenced manifest {} does not exist", descriptor.digest));
            }
        }

        Ok(())
    }
}
