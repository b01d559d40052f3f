//! Manifest sync for replica repos: mirror the primary's tag list, delete
//! manifests that were deleted upstream, and pull changed tags. Only the
//! manifest/tag topology is synchronized; blob bytes keep following lazily
//! via replication on pull.

use std::collections::HashSet;
use tracing::{debug, info};

use super::{Janitor, JobResult, MANIFEST_SYNC_INTERVAL_SECS};
use crate::db::{self, Manifest, Repo};
use crate::errors::RegistryV2Error;
use crate::oci::Reference;

impl Janitor {
    pub(crate) async fn sync_next_replica_repo(&self) -> Result<JobResult, RegistryV2Error> {
        let repo: Option<Repo> = sqlx::query_as(
            "SELECT r.* FROM repos r JOIN accounts a ON r.account_name = a.name
              WHERE (a.upstream_peer_hostname != '' OR a.external_peer_url != '')
                AND NOT a.is_deleting
                AND (r.next_manifest_sync_at IS NULL OR r.next_manifest_sync_at < $1)
              ORDER BY r.next_manifest_sync_at IS NULL DESC, r.next_manifest_sync_at ASC
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
            .ok_or_else(|| RegistryV2Error::Internal("account of replica repo vanished".into()))?;

        let client = self.processor.repo_client_for_upstream(&account, &repo).await?;
        let upstream_tags: HashSet<String> = client.get_tag_list().await?.into_iter().collect();

        // local tags that disappeared upstream are dropped
        let local_tags: Vec<(String, String)> =
            sqlx::query_as("SELECT name, digest FROM tags WHERE repo_id = $1")
                .bind(repo.id)
                .fetch_all(&self.db)
                .await?;
        for (tag_name, _) in local_tags.iter().filter(|(name, _)| !upstream_tags.contains(name)) {
            debug!("dropping tag {} of repo {}: deleted upstream", tag_name, repo.full_name());
            sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
                .bind(repo.id)
                .bind(tag_name)
                .execute(&self.db)
                .await?;
        }

        // changed or new tags are replicated right away, so the tag row
        // always points at a manifest that exists locally
        for tag_name in &upstream_tags {
            let reference = Reference::Tag(tag_name.clone());
            let upstream_digest = client.head_manifest(&reference).await?;
            let Some(upstream_digest) = upstream_digest else {
                continue;
            };
            let local = local_tags.iter().find(|(name, _)| name == tag_name);
            if local.is_some_and(|(_, digest)| *digest == upstream_digest.to_string()) {
                continue;
            }
            info!("syncing tag {} of repo {} from upstream", tag_name, repo.full_name());
            self.processor.replicate_manifest(&account, &repo, &reference).await?;
        }

        // untagged manifests that no longer exist upstream are deleted;
        // parents go before children, the rest becomes deletable next round
        let manifests: Vec<Manifest> = sqlx::query_as("SELECT * FROM manifests WHERE repo_id = $1")
            .bind(repo.id)
            .fetch_all(&self.db)
            .await?;
        for manifest in &manifests {
            let digest: crate::oci::Digest = manifest.digest.parse().map_err(|_| {
                RegistryV2Error::Internal(format!("manifest row carries invalid digest {:?}", manifest.digest))
            })?;
            if client
                .head_manifest(&Reference::Digest(digest.clone()))
                .await?
                .is_some()
            {
                continue;
            }
            debug!(
                "deleting manifest {} of repo {}: deleted upstream",
                manifest.digest,
                repo.full_name()
            );
            match self.processor.delete_manifest(&account, &repo, &digest).await {
                Ok(()) => {}
                // still referenced by a parent that survives upstream;
                // a later sync pass will get it once the parent is gone
                Err(RegistryV2Error::Denied(_)) => {}
                Err(err) => return Err(err),
            }
        }

        sqlx::query("UPDATE repos SET next_manifest_sync_at = $2 WHERE id = $1")
            .bind(repo.id)
            .bind(self.next_run(MANIFEST_SYNC_INTERVAL_SECS))
            .execute(&self.db)
            .await?;

        Ok(JobResult::DidWork)
    }
}
