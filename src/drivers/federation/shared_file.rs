//! Federation driver backed by per-account claim files in a shared directory
//! (e.g. a mounted object-store bucket). The backing store is only eventually
//! consistent, so every write is followed by a delayed reread that re-applies
//! the modification and checks that the write survived; a mismatch surfaces
//! as a write collision that the caller retries.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::info;

use super::{ClaimResult, FederationDriver, FederationError};
use crate::db::Account;

const SETTLE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct ClaimFile {
    #[serde(default)]
    primary_hostname: String,
    #[serde(default)]
    replica_hostnames: Vec<String>,
    #[serde(default)]
    sublease_token_secret: String,
}

pub struct SharedFileFederationDriver {
    directory: PathBuf,
    own_hostname: String,
    settle_delay: Duration,
}

impl SharedFileFederationDriver {
    pub fn new(directory: impl Into<PathBuf>, own_hostname: impl Into<String>) -> Self {
        SharedFileFederationDriver {
            directory: directory.into(),
            own_hostname: own_hostname.into(),
            settle_delay: SETTLE_DELAY,
        }
    }

    /// Shortens the write-reread settle delay; only useful in tests.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    fn claim_file_path(&self, account_name: &str) -> PathBuf {
        self.directory.join("accounts").join(format!("{account_name}.json"))
    }

    async fn read_claim_file(&self, account_name: &str) -> Result<ClaimFile, FederationError> {
        match fs::read(self.claim_file_path(account_name)).await {
            Ok(buf) => serde_json::from_slice(&buf)
                .map_err(|err| FederationError::Backend(format!("cannot parse claim file: {err}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ClaimFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_claim_file(&self, account_name: &str, file: &ClaimFile) -> Result<(), FederationError> {
        let path = self.claim_file_path(account_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let buf = serde_json::to_vec_pretty(file)
            .map_err(|err| FederationError::Backend(err.to_string()))?;
        fs::write(&path, buf).await?;
        Ok(())
    }

    /// Base implementation for all write operations: apply the modifier,
    /// write, wait, reread, apply the modifier again and require that the
    /// result matches what is on disk.
    async fn modify_claim_file<F>(&self, account_name: &str, mut modify: F) -> Result<(), FederationError>
    where
        F: FnMut(&mut ClaimFile, bool) -> Result<(), FederationError> + Send,
    {
        let file_old = self.read_claim_file(account_name).await?;

        // skip the write when nothing changes; this matters for
        // record_existing_account, which is a no-op most of the time
        let mut file_modified = file_old.clone();
        modify(&mut file_modified, true)?;
        file_modified.replica_hostnames.sort();
        if file_modified == file_old {
            return Ok(());
        }

        info!("federation: writing claim file for account {account_name}");
        self.write_claim_file(account_name, &file_modified).await?;

        tokio::time::sleep(self.settle_delay).await;

        let file_new = self.read_claim_file(account_name).await?;
        let mut file_new_modified = file_new.clone();
        modify(&mut file_new_modified, false)?;
        file_new_modified.replica_hostnames.sort();
        // We check that our own modification is still idempotently present,
        // not that the file is byte-identical to our write: someone editing
        // the file right after us is fine as long as our change survived.
        if file_new_modified != file_new {
            return Err(FederationError::WriteCollision(account_name.to_string()));
        }

        Ok(())
    }

    fn verify_ownership(file: &ClaimFile, expected_primary: &str, account_name: &str) -> Result<(), FederationError> {
        if file.primary_hostname != expected_primary {
            return Err(FederationError::Backend(format!(
                "expected primary for account {} to be hosted by {}, but is actually hosted by {:?}",
                account_name, expected_primary, file.primary_hostname
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FederationDriver for SharedFileFederationDriver {
    fn plugin_type_id(&self) -> &'static str {
        "shared-file"
    }

    async fn claim_account_name(&self, account: &Account, sublease_token_secret: &str) -> ClaimResult {
        let own_hostname = self.own_hostname.clone();
        let account_name = account.name.clone();

        if account.is_internal_replica() {
            if sublease_token_secret.is_empty() {
                return ClaimResult::Failed("missing sublease token".into());
            }
            let mut is_user_error = false;
            let upstream = account.upstream_peer_hostname.clone();
            let result = self
                .modify_claim_file(&account.name, |file, first_pass| {
                    // the secret is burned on the first pass; the reread pass
                    // tolerates the cleared field
                    if first_pass {
                        if file.sublease_token_secret != sublease_token_secret {
                            is_user_error = true;
                            return Err(FederationError::Backend(
                                "invalid sublease token (or token was already used)".into(),
                            ));
                        }
                        file.sublease_token_secret.clear();
                    }
                    Self::verify_ownership(file, &upstream, &account_name)?;
                    if !file.replica_hostnames.contains(&own_hostname) {
                        file.replica_hostnames.push(own_hostname.clone());
                    }
                    Ok(())
                })
                .await;
            return match result {
                Ok(()) => ClaimResult::Succeeded,
                Err(err) if is_user_error => ClaimResult::Failed(err.to_string()),
                Err(err) => ClaimResult::Errored(err.to_string()),
            };
        }

        if !sublease_token_secret.is_empty() {
            return ClaimResult::Failed("cannot check sublease token when claiming a primary account".into());
        }
        let mut is_user_error = false;
        let result = self
            .modify_claim_file(&account.name, |file, _first_pass| {
                if file.primary_hostname.is_empty() || file.primary_hostname == own_hostname {
                    file.primary_hostname = own_hostname.clone();
                    return Ok(());
                }
                is_user_error = true;
                Err(FederationError::Backend(format!(
                    "account name {} is already in use at {}",
                    account_name, file.primary_hostname
                )))
            })
            .await;
        match result {
            Ok(()) => ClaimResult::Succeeded,
            Err(err) if is_user_error => ClaimResult::Failed(err.to_string()),
            Err(err) => ClaimResult::Errored(err.to_string()),
        }
    }

    async fn issue_sublease_token_secret(&self, account: &Account) -> Result<String, FederationError> {
        if account.is_internal_replica() {
            return Err(FederationError::Backend("operation not allowed for replica accounts".into()));
        }

        let mut token_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut token_bytes);
        let secret = BASE64_STANDARD.encode(token_bytes);

        let own_hostname = self.own_hostname.clone();
        let account_name = account.name.clone();
        let secret_for_file = secret.clone();
        self.modify_claim_file(&account.name, move |file, _first_pass| {
            Self::verify_ownership(file, &own_hostname, &account_name)?;
            file.sublease_token_secret = secret_for_file.clone();
            Ok(())
        })
        .await?;

        Ok(secret)
    }

    async fn forfeit_account_name(&self, account: &Account) -> Result<(), FederationError> {
        // replica: just remove ourselves from the replica set
        if account.is_internal_replica() {
            let own_hostname = self.own_hostname.clone();
            return self
                .modify_claim_file(&account.name, move |file, _first_pass| {
                    file.replica_hostnames.retain(|h| h != &own_hostname);
                    Ok(())
                })
                .await;
        }

        // primary: sanity checks, then delete the claim file entirely
        let file = self.read_claim_file(&account.name).await?;
        Self::verify_ownership(&file, &self.own_hostname, &account.name)?;
        if !file.replica_hostnames.is_empty() {
            return Err(FederationError::Backend(format!(
                "cannot delete primary account {}: {} replicas are still attached to it",
                account.name,
                file.replica_hostnames.len()
            )));
        }
        match fs::remove_file(self.claim_file_path(&account.name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn record_existing_account(&self, account: &Account, _now: i64) -> Result<(), FederationError> {
        let expected_primary = if account.is_internal_replica() {
            account.upstream_peer_hostname.clone()
        } else {
            self.own_hostname.clone()
        };
        let is_replica = account.is_internal_replica();
        let own_hostname = self.own_hostname.clone();
        let account_name = account.name.clone();

        self.modify_claim_file(&account.name, move |file, _first_pass| {
            if file.primary_hostname.is_empty() || file.primary_hostname == expected_primary {
                file.primary_hostname = expected_primary.clone();
            } else {
                return Err(FederationError::Backend(format!(
                    "expected primary for account {} to be hosted by {}, but is actually hosted by {:?}",
                    account_name, expected_primary, file.primary_hostname
                )));
            }
            if is_replica && !file.replica_hostnames.contains(&own_hostname) {
                file.replica_hostnames.push(own_hostname.clone());
            }
            Ok(())
        })
        .await
    }

    async fn find_primary_account(&self, account_name: &str) -> Result<Option<String>, FederationError> {
        let file = self.read_claim_file(account_name).await?;
        if file.primary_hostname.is_empty() {
            return Ok(None);
        }
        Ok(Some(file.primary_hostname))
    }
}

/// Convenience for checking whether a directory is usable as claim storage.
pub fn check_directory(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path.join("accounts"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Account;

    fn account(name: &str, upstream: &str) -> Account {
        Account {
            name: name.into(),
            auth_tenant_id: "tenant1".into(),
            upstream_peer_hostname: upstream.into(),
            external_peer_url: String::new(),
            external_peer_username: String::new(),
            external_peer_password: String::new(),
            platform_filter: String::new(),
            gc_policies_json: "[]".into(),
            rbac_policies_json: "[]".into(),
            tag_policies_json: "[]".into(),
            validation_policy_json: String::new(),
            security_scan_policies_json: "[]".into(),
            is_deleting: false,
            is_managed: false,
            next_blob_sweep_at: None,
            next_storage_sweep_at: None,
            next_federation_announcement_at: None,
            next_deletion_attempt_at: None,
        }
    }

    fn driver(dir: &Path, hostname: &str) -> SharedFileFederationDriver {
        SharedFileFederationDriver::new(dir, hostname).with_settle_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_primary_claim_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let first = driver(dir.path(), "keppel-1.example.org");
        let second = driver(dir.path(), "keppel-2.example.org");
        let library = account("library", "");

        assert!(matches!(first.claim_account_name(&library, "").await, ClaimResult::Succeeded));
        // idempotent for the same deployment
        assert!(matches!(first.claim_account_name(&library, "").await, ClaimResult::Succeeded));
        // a different deployment is refused with a user error
        assert!(matches!(second.claim_account_name(&library, "").await, ClaimResult::Failed(_)));

        assert_eq!(
            first.find_primary_account("library").await.unwrap(),
            Some("keppel-1.example.org".to_string())
        );
        assert_eq!(first.find_primary_account("no-such").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sublease_handoff_burns_secret() {
        let dir = tempfile::tempdir().unwrap();
        let primary = driver(dir.path(), "keppel-1.example.org");
        let replica_peer = driver(dir.path(), "keppel-2.example.org");

        let library = account("library", "");
        assert!(matches!(primary.claim_account_name(&library, "").await, ClaimResult::Succeeded));

        let secret = primary.issue_sublease_token_secret(&library).await.unwrap();
        assert!(!secret.is_empty());

        let replica = account("library", "keppel-1.example.org");
        assert!(matches!(
            replica_peer.claim_account_name(&replica, "wrong-secret").await,
            ClaimResult::Failed(_)
        ));
        assert!(matches!(
            replica_peer.claim_account_name(&replica, &secret).await,
            ClaimResult::Succeeded
        ));
        // the secret is one-shot
        assert!(matches!(
            replica_peer.claim_account_name(&replica, &secret).await,
            ClaimResult::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_forfeit_primary_blocked_while_replicas_exist() {
        let dir = tempfile::tempdir().unwrap();
        let primary = driver(dir.path(), "keppel-1.example.org");
        let replica_peer = driver(dir.path(), "keppel-2.example.org");

        let library = account("library", "");
        primary.claim_account_name(&library, "").await;
        let secret = primary.issue_sublease_token_secret(&library).await.unwrap();
        let replica = account("library", "keppel-1.example.org");
        replica_peer.claim_account_name(&replica, &secret).await;

        assert!(primary.forfeit_account_name(&library).await.is_err());

        replica_peer.forfeit_account_name(&replica).await.unwrap();
        primary.forfeit_account_name(&library).await.unwrap();
        assert_eq!(primary.find_primary_account("library").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_existing_account_repairs_missing_claim() {
        let dir = tempfile::tempdir().unwrap();
        let primary = driver(dir.path(), "keppel-1.example.org");
        let library = account("library", "");

        primary.record_existing_account(&library, 0).await.unwrap();
        assert_eq!(
            primary.find_primary_account("library").await.unwrap(),
            Some("keppel-1.example.org".to_string())
        );
        // repeat is a no-op (and must not write)
        primary.record_existing_account(&library, 0).await.unwrap();
    }
}
