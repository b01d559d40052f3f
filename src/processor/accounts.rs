//! Account lifecycle: creation, update, and marking for deletion. The actual
//! teardown of a marked account is driven by the janitor.

use tracing::info;

use super::Processor;
use crate::client::peer::PeerClient;
use crate::db::{self, validate_new_account_name, Account};
use crate::drivers::ClaimResult;
use crate::errors::RegistryV2Error;
use crate::oci::PlatformFilter;
use crate::policies::{GcPolicy, RbacPolicy, TagPolicy, ValidationPolicy};

/// How an account gets its contents.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationPolicy {
    /// Replica of an account on a peer keppel; contents are pulled on first use.
    OnFirstUse { upstream_peer_hostname: String },
    /// Replica of a repository namespace on an external registry.
    FromExternalOnFirstUse {
        url: String,
        username: String,
        password: String,
    },
}

/// An account configuration as submitted through the Keppel API.
pub struct AccountRequest {
    pub name: String,
    pub auth_tenant_id: String,
    /// None on update means "keep the existing policy". The strategy itself
    /// can never change after creation.
    pub replication: Option<ReplicationPolicy>,
    pub gc_policies: Vec<GcPolicy>,
    pub rbac_policies: Vec<RbacPolicy>,
    pub tag_policies: Vec<TagPolicy>,
    pub validation_policy: Option<ValidationPolicy>,
    pub platform_filter: Option<PlatformFilter>,
    /// Required when creating an internal replica; issued by the primary.
    pub sublease_token_secret: Option<String>,
}

fn strategy_of(account: &Account) -> Option<ReplicationPolicy> {
    if account.is_internal_replica() {
        return Some(ReplicationPolicy::OnFirstUse {
            upstream_peer_hostname: account.upstream_peer_hostname.clone(),
        });
    }
    if account.is_external_replica() {
        return Some(ReplicationPolicy::FromExternalOnFirstUse {
            url: account.external_peer_url.clone(),
            username: account.external_peer_username.clone(),
            password: account.external_peer_password.clone(),
        });
    }
    None
}

fn same_strategy(lhs: &Option<ReplicationPolicy>, rhs: &Option<ReplicationPolicy>) -> bool {
    matches!(
        (lhs, rhs),
        (None, None)
            | (Some(ReplicationPolicy::OnFirstUse { .. }), Some(ReplicationPolicy::OnFirstUse { .. }))
            | (
                Some(ReplicationPolicy::FromExternalOnFirstUse { .. }),
                Some(ReplicationPolicy::FromExternalOnFirstUse { .. })
            )
    )
}

impl Processor {
    pub async fn create_or_update_account(&self, request: AccountRequest) -> Result<Account, RegistryV2Error> {
        validate_new_account_name(&request.name)?;

        let existing = db::find_account(&self.db, &request.name).await?;
        if let Some(existing) = &existing {
            if existing.auth_tenant_id != request.auth_tenant_id {
                return Err(RegistryV2Error::Denied(
                    "account name already in use by a different tenant".into(),
                ));
            }
        }

        for policy in &request.gc_policies {
            policy.validate()?;
        }
        let is_replica_request = match (&existing, &request.replication) {
            (Some(existing), _) => existing.is_replica(),
            (None, replication) => replication.is_some(),
        };
        for policy in &request.rbac_policies {
            policy.validate(is_replica_request)?;
        }
        for policy in &request.tag_policies {
            policy.validate()?;
        }

        // the replication strategy is fixed at creation
        let replication = match (&existing, request.replication) {
            (Some(existing), None) => strategy_of(existing),
            (Some(existing), Some(requested)) => {
                let existing_strategy = strategy_of(existing);
                if !same_strategy(&existing_strategy, &Some(requested.clone())) {
                    return Err(RegistryV2Error::Denied(
                        "cannot change replication policy on existing account".into(),
                    ));
                }
                Some(requested)
            }
            (None, replication) => replication,
        };

        // validate the upstream peer before doing anything durable
        if let Some(ReplicationPolicy::OnFirstUse { upstream_peer_hostname }) = &replication {
            if db::find_peer(&self.db, upstream_peer_hostname).await?.is_none() {
                return Err(RegistryV2Error::ManifestInvalid(format!(
                    "unknown peer registry: {upstream_peer_hostname:?}"
                )));
            }
        }

        // platform filter rules
        let platform_filter = match &existing {
            None => match &replication {
                None => {
                    if request.platform_filter.is_some() {
                        return Err(RegistryV2Error::ManifestInvalid(
                            "platform filter is only allowed on replica accounts".into(),
                        ));
                    }
                    PlatformFilter::default()
                }
                Some(ReplicationPolicy::FromExternalOnFirstUse { .. }) => {
                    request.platform_filter.clone().unwrap_or_default()
                }
                Some(ReplicationPolicy::OnFirstUse { upstream_peer_hostname }) => {
                    // an internal replica's filter must equal the primary's
                    let peer = db::find_peer(&self.db, upstream_peer_hostname)
                        .await?
                        .expect("peer existence was checked above");
                    let client = PeerClient::new(&peer, &self.config.api_public_hostname);
                    let upstream = client.get_foreign_account_config(&request.name).await?;
                    if let Some(requested) = &request.platform_filter {
                        if *requested != upstream.platform_filter {
                            return Err(RegistryV2Error::Denied(
                                "platform filter of a replica account must match the primary account".into(),
                            ));
                        }
                    }
                    upstream.platform_filter
                }
            },
            Some(existing) => {
                let existing_filter = existing.platform_filter();
                if let Some(requested) = &request.platform_filter {
                    if *requested != existing_filter {
                        return Err(RegistryV2Error::Denied(
                            "cannot change platform filter on existing account".into(),
                        ));
                    }
                }
                existing_filter
            }
        };

        let (upstream_peer_hostname, external_peer_url, external_peer_username, external_peer_password) =
            match &replication {
                None => (String::new(), String::new(), String::new(), String::new()),
                Some(ReplicationPolicy::OnFirstUse { upstream_peer_hostname }) => {
                    (upstream_peer_hostname.clone(), String::new(), String::new(), String::new())
                }
                Some(ReplicationPolicy::FromExternalOnFirstUse { url, username, password }) => {
                    (String::new(), url.clone(), username.clone(), password.clone())
                }
            };

        let gc_policies_json = serde_json::to_string(&request.gc_policies)?;
        let rbac_policies_json = serde_json::to_string(&request.rbac_policies)?;
        let tag_policies_json = serde_json::to_string(&request.tag_policies)?;
        let validation_policy_json = match &request.validation_policy {
            Some(policy) => serde_json::to_string(policy)?,
            None => String::new(),
        };

        if existing.is_none() {
            // claim the account name across the peer group before the row
            // becomes visible
            let sublease_token_secret = request.sublease_token_secret.clone().unwrap_or_default();
            if !upstream_peer_hostname.is_empty() && sublease_token_secret.is_empty() {
                return Err(RegistryV2Error::Denied(
                    "creating a replica account requires a sublease token from the primary".into(),
                ));
            }
            let claim_account = Account {
                name: request.name.clone(),
                auth_tenant_id: request.auth_tenant_id.clone(),
                upstream_peer_hostname: upstream_peer_hostname.clone(),
                external_peer_url: external_peer_url.clone(),
                external_peer_username: String::new(),
                external_peer_password: String::new(),
                platform_filter: platform_filter.to_db_string(),
                gc_policies_json: gc_policies_json.clone(),
                rbac_policies_json: rbac_policies_json.clone(),
                tag_policies_json: tag_policies_json.clone(),
                validation_policy_json: validation_policy_json.clone(),
                security_scan_policies_json: "[]".into(),
                is_deleting: false,
                is_managed: false,
                next_blob_sweep_at: None,
                next_storage_sweep_at: None,
                next_federation_announcement_at: None,
                next_deletion_attempt_at: None,
            };
            match self.fd.claim_account_name(&claim_account, &sublease_token_secret).await {
                ClaimResult::Succeeded => {}
                ClaimResult::Failed(message) => return Err(RegistryV2Error::Denied(message)),
                ClaimResult::Errored(message) => return Err(RegistryV2Error::Internal(message)),
            }

            self.sd
                .can_setup_account(&request.name)
                .await
                .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;

            sqlx::query(
                "INSERT INTO accounts
                    (name, auth_tenant_id, upstream_peer_hostname, external_peer_url,
                     external_peer_username, external_peer_password, platform_filter,
                     gc_policies_json, rbac_policies_json, tag_policies_json, validation_policy_json)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(&request.name)
            .bind(&request.auth_tenant_id)
            .bind(&upstream_peer_hostname)
            .bind(&external_peer_url)
            .bind(&external_peer_username)
            .bind(&external_peer_password)
            .bind(platform_filter.to_db_string())
            .bind(&gc_policies_json)
            .bind(&rbac_policies_json)
            .bind(&tag_policies_json)
            .bind(&validation_policy_json)
            .execute(&self.db)
            .await?;
            info!("account {:?} created", request.name);
        } else {
            sqlx::query(
                "UPDATE accounts
                    SET gc_policies_json = $2, rbac_policies_json = $3, tag_policies_json = $4,
                        validation_policy_json = $5, external_peer_username = $6, external_peer_password = $7
                  WHERE name = $1",
            )
            .bind(&request.name)
            .bind(&gc_policies_json)
            .bind(&rbac_policies_json)
            .bind(&tag_policies_json)
            .bind(&validation_policy_json)
            .bind(&external_peer_username)
            .bind(&external_peer_password)
            .execute(&self.db)
            .await?;
        }

        db::find_account(&self.db, &request.name)
            .await?
            .ok_or_else(|| RegistryV2Error::Internal("account row vanished".into()))
    }

    /// Marks an account for deletion and arms the janitor's deletion job.
    /// All further uploads and manifest pushes are refused from here on.
    pub async fn mark_account_for_deletion(&self, account_name: &str) -> Result<(), RegistryV2Error> {
        let updated = sqlx::query(
            "UPDATE accounts SET is_deleting = TRUE, next_deletion_attempt_at = $2 WHERE name = $1",
        )
        .bind(account_name)
        .bind(self.now())
        .execute(&self.db)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(RegistryV2Error::NameUnknown);
        }
        info!("account {account_name:?} marked for deletion");
        Ok(())
    }

    /// Issues a sublease token enabling a peer to create a replica of this
    /// primary account.
    pub async fn issue_sublease_token(&self, account: &Account) -> Result<String, RegistryV2Error> {
        if account.is_replica() {
            return Err(RegistryV2Error::Denied(
                "sublease tokens can only be issued for primary accounts".into(),
            ));
        }
        self.fd
            .issue_sublease_token_secret(account)
            .await
            .map_err(|err| RegistryV2Error::Internal(err.to_string()))
    }
}
