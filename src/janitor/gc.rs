//! Image garbage collection: evaluate the account's user-defined GC policies
//! against every manifest of one due repo. Protect policies beat delete
//! policies; manifests referenced by other manifests are never deleted here
//! (the parent has to go first, through whatever path deletes it).

use std::collections::HashMap;
use tracing::info;

use super::{Janitor, JobResult, IMAGE_GC_INTERVAL_SECS};
use crate::db::{self, Manifest, Repo};
use crate::errors::RegistryV2Error;
use crate::policies::{GcAction, ManifestInfo};

impl Janitor {
    pub(crate) async fn collect_garbage_next(&self) -> Result<JobResult, RegistryV2Error> {
        let repo: Option<Repo> = sqlx::query_as(
            "SELECT * FROM repos
              WHERE next_gc_at IS NULL OR next_gc_at < $1
              ORDER BY next_gc_at IS NULL DESC, next_gc_at ASC
              LIMIT 1",
        )
        .bind(self.now())
        .fetch_optional(&self.db)
        .await?;
        let Some(repo) = repo else {
            return Ok(JobResult::NothingToDo);
        };

        let account = db::find_account(&self.db, &repo.account_name)
            .await?
            .ok_or_else(|| RegistryV2Error::Internal("account of repo vanished".into()))?;
        let policies = account.gc_policies()?;
        let relevant: Vec<_> = policies.iter().filter(|p| p.matches_repository(&repo.name)).collect();

        if !relevant.is_empty() {
            let now = self.now();
            let manifests: Vec<Manifest> = sqlx::query_as("SELECT * FROM manifests WHERE repo_id = $1")
                .bind(repo.id)
                .fetch_all(&self.db)
                .await?;

            let mut tags_by_digest: HashMap<String, Vec<String>> = HashMap::new();
            let tag_rows: Vec<(String, String)> =
                sqlx::query_as("SELECT name, digest FROM tags WHERE repo_id = $1")
                    .bind(repo.id)
                    .fetch_all(&self.db)
                    .await?;
            for (tag_name, digest) in tag_rows {
                tags_by_digest.entry(digest).or_default().push(tag_name);
            }

            let mut deleted = 0u64;
            for manifest in &manifests {
                let info = ManifestInfo {
                    repo_name: repo.name.clone(),
                    pushed_at: manifest.pushed_at,
                    last_pulled_at: manifest.last_pulled_at,
                    tags: tags_by_digest.get(&manifest.digest).cloned().unwrap_or_default(),
                    labels: manifest.labels(),
                };

                // first matching policy decides
                let decision = relevant.iter().find(|p| p.matches(&info, now)).map(|p| p.action);
                if decision != Some(GcAction::Delete) {
                    continue;
                }

                let digest = manifest.digest.parse().map_err(|_| {
                    RegistryV2Error::Internal(format!("manifest row carries invalid digest {:?}", manifest.digest))
                })?;
                match self.processor.delete_manifest(&account, &repo, &digest).await {
                    Ok(()) => deleted += 1,
                    // still referenced by a parent manifest; not ours to take
                    Err(RegistryV2Error::Denied(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            if deleted > 0 {
                info!("image GC deleted {deleted} manifests from repo {}", repo.full_name());
            }
        }

        sqlx::query("UPDATE repos SET next_gc_at = $2 WHERE id = $1")
            .bind(repo.id)
            .bind(self.next_run(IMAGE_GC_INTERVAL_SECS))
            .execute(&self.db)
            .await?;

        Ok(JobResult::DidWork)
    }
}
