//! Manifest ingestion: validation and persistence on push, replication from
//! upstream on first pull, and deletion. Reference resolution and the
//! manifest row live in one transaction; blob mounts are made idempotently
//! before that transaction, so a racing replicator is harmless.

use chrono::DateTime;
use std::collections::HashMap;
use tracing::{debug, error};

use super::Processor;
use crate::db::{
    self, Account, Manifest, Repo, MANIFEST_VALIDATION_INTERVAL_SECS, VULN_STATUS_PENDING,
};
use crate::errors::RegistryV2Error;
use crate::metrics;
use crate::oci::{Digest, ParsedManifest, Reference};

/// A manifest as it arrives in a PUT request.
pub struct IncomingManifest {
    pub reference: Reference,
    pub media_type: String,
    pub contents: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq)]
enum IngestMethod {
    Push,
    Replication,
}

impl IngestMethod {
    fn label(self) -> &'static str {
        match self {
            IngestMethod::Push => "registry-api",
            IngestMethod::Replication => "replication",
        }
    }
}

impl Processor {
    /// Validates and persists a manifest pushed through the registry API.
    pub async fn validate_and_store_manifest(
        &self,
        account: &Account,
        repo: &Repo,
        incoming: IncomingManifest,
    ) -> Result<Manifest, RegistryV2Error> {
        // pushed manifests must match a digest reference exactly
        if let Reference::Digest(expected) = &incoming.reference {
            if *expected != Digest::of_bytes(&incoming.contents) {
                return Err(RegistryV2Error::DigestInvalid);
            }
        }
        self.ingest_manifest(
            account,
            repo,
            &incoming.media_type,
            incoming.contents,
            incoming.reference.as_tag(),
            IngestMethod::Push,
        )
        .await
    }

    /// Replicates a manifest from the account's upstream registry, including
    /// any child manifests that are not yet present locally. Returns the
    /// manifest bytes so the caller can serve them to the waiting client.
    pub async fn replicate_manifest(
        &self,
        account: &Account,
        repo: &Repo,
        reference: &Reference,
    ) -> Result<(Vec<u8>, Manifest), RegistryV2Error> {
        let client = self.repo_client_for_upstream(account, repo).await?;
        let (contents, media_type) = client.download_manifest(reference).await?;

        let manifest = self
            .ingest_manifest(
                account,
                repo,
                &media_type,
                contents.clone(),
                reference.as_tag(),
                IngestMethod::Replication,
            )
            .await?;
        Ok((contents, manifest))
    }

    async fn ingest_manifest(
        &self,
        account: &Account,
        repo: &Repo,
        media_type: &str,
        contents: Vec<u8>,
        tag_name: Option<&str>,
        method: IngestMethod,
    ) -> Result<Manifest, RegistryV2Error> {
        if account.is_deleting {
            return Err(RegistryV2Error::Denied("account is being deleted".into()));
        }

        let parsed = ParsedManifest::parse(media_type, &contents)?;
        let digest = Digest::of_bytes(&contents);
        let digest_str = digest.to_string();
        let now = self.now();

        let existing = db::find_manifest(&self.db, repo.id, &digest_str).await?;
        if existing.is_none() {
            self.check_manifest_quota(account).await?;
        }

        // resolve blob references; mounts are idempotent and happen before
        // the manifest transaction
        let mut blob_ids = Vec::new();
        let mut config_blob = None;
        for descriptor in parsed.blob_references() {
            let blob = match method {
                IngestMethod::Push => db::find_blob(&self.db, &account.name, &descriptor.digest.to_string())
                    .await?
                    .ok_or_else(|| RegistryV2Error::ManifestBlobUnknown(descriptor.digest.to_string()))?,
                IngestMethod::Replication => {
                    self.find_blob_or_insert_unbacked(
                        &account.name,
                        &descriptor.digest,
                        &descriptor.media_type,
                        descriptor.size,
                    )
                    .await?
                }
            };
            if method == IngestMethod::Push && !blob.is_unbacked() && blob.size_bytes as u64 != descriptor.size {
                return Err(RegistryV2Error::ManifestInvalid(format!(
                    "manifest declares {} bytes for blob {}, but it has {} bytes",
                    descriptor.size, descriptor.digest, blob.size_bytes
                )));
            }
            db::mount_blob(&self.db, blob.id, repo.id).await?;
            if parsed
                .image_config_blob()
                .is_some_and(|config| config.digest == descriptor.digest)
            {
                config_blob = Some(blob.clone());
            }
            blob_ids.push(blob.id);
        }

        // resolve child manifests
        let platform_filter = account.platform_filter();
        let mut child_digests = Vec::new();
        for descriptor in parsed.manifest_references(&platform_filter) {
            let child_digest = descriptor.digest.to_string();
            let child = db::find_manifest(&self.db, repo.id, &child_digest).await?;
            if child.is_none() {
                match method {
                    IngestMethod::Push => {
                        return Err(RegistryV2Error::ManifestBlobUnknown(child_digest));
                    }
                    IngestMethod::Replication => {
                        let child_ref = Reference::Digest(descriptor.digest.clone());
                        Box::pin(self.replicate_manifest(account, repo, &child_ref)).await?;
                    }
                }
            }
            child_digests.push(child_digest);
        }

        // collect labels and layer timestamps from the image configuration,
        // where one is locally available
        let mut labels: HashMap<String, String> = parsed.annotations().clone();
        let mut min_layer_created_at = None;
        let mut max_layer_created_at = None;
        if let Some(config_blob) = &config_blob {
            if !config_blob.is_unbacked() {
                if let Some(config) = self.read_image_config(&account.name, &config_blob.storage_id).await {
                    if let Some(config_labels) = config
                        .pointer("/config/Labels")
                        .and_then(|v| v.as_object())
                    {
                        for (key, value) in config_labels {
                            if let Some(value) = value.as_str() {
                                labels.insert(key.clone(), value.to_string());
                            }
                        }
                    }
                    if let Some(history) = config.get("history").and_then(|v| v.as_array()) {
                        for entry in history {
                            let Some(created) = entry.get("created").and_then(|v| v.as_str()) else {
                                continue;
                            };
                            let Ok(created) = DateTime::parse_from_rfc3339(created) else {
                                continue;
                            };
                            let timestamp = created.timestamp();
                            min_layer_created_at =
                                Some(min_layer_created_at.map_or(timestamp, |t: i64| t.min(timestamp)));
                            max_layer_created_at =
                                Some(max_layer_created_at.map_or(timestamp, |t: i64| t.max(timestamp)));
                        }
                    }
                }
            }
        }

        if method == IngestMethod::Push {
            if let Some(policy) = account.validation_policy()? {
                policy.check_labels(&labels)?;
            }
        }

        // tag policies: a tag may not move to a different digest while a
        // block_overwrite policy covers it
        if let Some(tag_name) = tag_name {
            if let Some(existing_tag) = db::find_tag(&self.db, repo.id, tag_name).await? {
                if existing_tag.digest != digest_str {
                    for policy in account.tag_policies()? {
                        if policy.block_overwrite && policy.matches(&repo.name, tag_name) {
                            return Err(RegistryV2Error::Denied(format!(
                                "cannot overwrite tag {tag_name:?}: forbidden by tag policy"
                            )));
                        }
                    }
                }
            }
        }

        // storage before DB commit: if we crash now, storage-sweep reclaims
        self.sd
            .write_manifest(&account.name, &repo.name, &digest_str, &contents)
            .await
            .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;

        let labels_json = if labels.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&labels)?
        };

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO manifests (repo_id, digest, media_type, size_bytes, pushed_at, next_validation_at, labels_json, min_layer_created_at, max_layer_created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (repo_id, digest) DO UPDATE
                SET media_type = $3, size_bytes = $4, next_validation_at = $6,
                    labels_json = $7, min_layer_created_at = $8, max_layer_created_at = $9",
        )
        .bind(repo.id)
        .bind(&digest_str)
        .bind(media_type)
        .bind(contents.len() as i64)
        .bind(now)
        .bind(now + MANIFEST_VALIDATION_INTERVAL_SECS)
        .bind(&labels_json)
        .bind(min_layer_created_at)
        .bind(max_layer_created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO manifest_contents (repo_id, digest, content) VALUES ($1, $2, $3)
             ON CONFLICT (repo_id, digest) DO UPDATE SET content = $3",
        )
        .bind(repo.id)
        .bind(&digest_str)
        .bind(&contents)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2")
            .bind(repo.id)
            .bind(&digest_str)
            .execute(&mut *tx)
            .await?;
        for blob_id in &blob_ids {
            sqlx::query("INSERT INTO manifest_blob_refs (repo_id, digest, blob_id) VALUES ($1, $2, $3)")
                .bind(repo.id)
                .bind(&digest_str)
                .bind(blob_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2")
            .bind(repo.id)
            .bind(&digest_str)
            .execute(&mut *tx)
            .await?;
        for child_digest in &child_digests {
            sqlx::query(
                "INSERT INTO manifest_manifest_refs (repo_id, parent_digest, child_digest) VALUES ($1, $2, $3)",
            )
            .bind(repo.id)
            .bind(&digest_str)
            .bind(child_digest)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(tag_name) = tag_name {
            sqlx::query(
                "INSERT INTO tags (repo_id, name, digest, pushed_at) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (repo_id, name) DO UPDATE SET digest = $3, pushed_at = $4",
            )
            .bind(repo.id)
            .bind(tag_name)
            .bind(&digest_str)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO security_info (repo_id, digest, vuln_status, next_check_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (repo_id, digest) DO NOTHING",
        )
        .bind(repo.id)
        .bind(&digest_str)
        .bind(VULN_STATUS_PENDING)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::MANIFESTS_PUSHED
            .with_label_values(&[&account.name, method.label()])
            .inc();
        debug!("stored manifest {} in repo {}", digest_str, repo.full_name());

        db::find_manifest(&self.db, repo.id, &digest_str)
            .await?
            .ok_or_else(|| RegistryV2Error::Internal("manifest row vanished after commit".into()))
    }

    async fn check_manifest_quota(&self, account: &Account) -> Result<(), RegistryV2Error> {
        let Some(quota) = db::find_quota(&self.db, &account.auth_tenant_id).await? else {
            return Ok(());
        };
        let used = db::manifest_count_for_tenant(&self.db, &account.auth_tenant_id).await?;
        if used >= quota.max_manifests {
            return Err(RegistryV2Error::QuotaExceeded(format!(
                "manifest quota exceeded ({used}/{} manifests in use)",
                quota.max_manifests
            )));
        }
        Ok(())
    }

    async fn read_image_config(&self, account_name: &str, storage_id: &str) -> Option<serde_json::Value> {
        let (mut reader, size) = self.sd.read_blob(account_name, storage_id).await.ok()?;
        // image configurations are small JSON documents; anything huge is
        // not something we should buffer
        if size > 4 << 20 {
            return None;
        }
        let mut buf = Vec::with_capacity(size as usize);
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.ok()?;
        serde_json::from_slice(&buf).ok()
    }

    /// Deletes a manifest. Refused while other manifests still reference it,
    /// so parents must be deleted before their children become deletable.
    pub async fn delete_manifest(
        &self,
        account: &Account,
        repo: &Repo,
        digest: &Digest,
    ) -> Result<(), RegistryV2Error> {
        let digest_str = digest.to_string();

        let mut tx = self.db.begin().await?;
        let (parent_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM manifest_manifest_refs WHERE repo_id = $1 AND child_digest = $2",
        )
        .bind(repo.id)
        .bind(&digest_str)
        .fetch_one(&mut *tx)
        .await?;
        if parent_count > 0 {
            return Err(RegistryV2Error::Denied(format!(
                "cannot delete manifest {digest_str}: it is still referenced by {parent_count} other manifests"
            )));
        }

        sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND digest = $2")
            .bind(repo.id)
            .bind(&digest_str)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM manifests WHERE repo_id = $1 AND digest = $2")
            .bind(repo.id)
            .bind(&digest_str)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(RegistryV2Error::ManifestUnknown);
        }
        tx.commit().await?;

        // DB before storage for deletes: if this fails, storage-sweep will
        // find the orphaned manifest object later
        if let Err(err) = self.sd.delete_manifest(&account.name, &repo.name, &digest_str).await {
            error!(
                "cannot delete manifest {} of repo {} from storage (will be cleaned up by storage sweep): {}",
                digest_str,
                repo.full_name(),
                err
            );
        }
        Ok(())
    }

    /// Deletes a tag without touching the manifest it points to.
    pub async fn delete_tag(
        &self,
        account: &Account,
        repo: &Repo,
        tag_name: &str,
    ) -> Result<(), RegistryV2Error> {
        for policy in account.tag_policies()? {
            if policy.block_delete && policy.matches(&repo.name, tag_name) {
                return Err(RegistryV2Error::Denied(format!(
                    "cannot delete tag {tag_name:?}: forbidden by tag policy"
                )));
            }
        }

        let deleted = sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
            .bind(repo.id)
            .bind(tag_name)
            .execute(&self.db)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(RegistryV2Error::ManifestUnknown);
        }
        Ok(())
    }
}
