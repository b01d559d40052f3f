//! Cleanup of chunked uploads that were started but never finished.

use tracing::info;

use super::{Janitor, JobResult, ABANDONED_UPLOAD_AGE_SECS};
use crate::errors::RegistryV2Error;

#[derive(sqlx::FromRow)]
struct AbandonedUpload {
    repo_id: i64,
    uuid: String,
    storage_id: String,
    num_chunks: i64,
    account_name: String,
}

impl Janitor {
    pub(crate) async fn clean_next_abandoned_upload(&self) -> Result<JobResult, RegistryV2Error> {
        let upload: Option<AbandonedUpload> = sqlx::query_as(
            "SELECT u.repo_id AS repo_id, u.uuid AS uuid, u.storage_id AS storage_id,
                    u.num_chunks AS num_chunks, r.account_name AS account_name
               FROM uploads u JOIN repos r ON u.repo_id = r.id
              WHERE u.updated_at < $1
              ORDER BY u.updated_at ASC
              LIMIT 1",
        )
        .bind(self.now() - ABANDONED_UPLOAD_AGE_SECS)
        .fetch_optional(&self.db)
        .await?;
        let Some(upload) = upload else {
            return Ok(JobResult::NothingToDo);
        };

        info!("aborting abandoned upload {} in account {}", upload.uuid, upload.account_name);
        if upload.num_chunks > 0 {
            match self
                .sd
                .abort_blob_upload(&upload.account_name, &upload.storage_id, upload.num_chunks as u32)
                .await
            {
                Ok(()) | Err(crate::drivers::StorageError::NotFound) => {}
                Err(err) => return Err(RegistryV2Error::Internal(err.to_string())),
            }
        }
        sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
            .bind(upload.repo_id)
            .bind(&upload.uuid)
            .execute(&self.db)
            .await?;

        Ok(JobResult::DidWork)
    }
}
