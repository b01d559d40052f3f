//! Row types mapping to the metadata schema. Timestamps are Unix seconds;
//! `next_*_at` job clocks are NULL until first armed.

use lazy_static::lazy_static;
use regex::Regex;
use sqlx::FromRow;

use crate::errors::RegistryV2Error;
use crate::oci::{Digest, PlatformFilter};
use crate::policies::{parse_policies, GcPolicy, RbacPolicy, TagPolicy, ValidationPolicy};

/// Blobs are revalidated this often (digest recomputation).
pub const BLOB_VALIDATION_INTERVAL_SECS: i64 = 7 * 24 * 3600;
/// Manifests are revalidated this often (reference consistency).
pub const MANIFEST_VALIDATION_INTERVAL_SECS: i64 = 24 * 3600;
/// Failed validations are retried on this shorter interval.
pub const VALIDATION_RETRY_INTERVAL_SECS: i64 = 10 * 60;
/// Grace period between marking an object for deletion and sweeping it.
pub const MARK_AND_SWEEP_GRACE_SECS: i64 = 3600;

lazy_static! {
    static ref ACCOUNT_NAME_REGEX: Regex = Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap();
    static ref API_VERSION_REGEX: Regex = Regex::new(r"^v[0-9]+$").unwrap();
}

/// Checks whether the given string has the shape of an account name (a DNS
/// label). Reserved names (`keppel*`, API-version lookalikes) are refused at
/// account creation, not here, since existing requests must still resolve.
pub fn is_account_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 48 && ACCOUNT_NAME_REGEX.is_match(name)
}

/// Validates an account name for creation, including the reservation rules.
pub fn validate_new_account_name(name: &str) -> Result<(), RegistryV2Error> {
    if !is_account_name(name) {
        return Err(RegistryV2Error::NameInvalid);
    }
    if name.starts_with("keppel") {
        return Err(RegistryV2Error::Denied(
            "account names starting with \"keppel\" are reserved for internal use".into(),
        ));
    }
    if API_VERSION_REGEX.is_match(name) {
        return Err(RegistryV2Error::Denied(
            "account names that look like API versions are reserved for internal use".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub name: String,
    pub auth_tenant_id: String,
    /// Non-empty for internal replica accounts: hostname of the peer holding
    /// the primary account.
    pub upstream_peer_hostname: String,
    /// Non-empty for external replica accounts.
    pub external_peer_url: String,
    pub external_peer_username: String,
    pub external_peer_password: String,
    pub platform_filter: String,
    pub gc_policies_json: String,
    pub rbac_policies_json: String,
    pub tag_policies_json: String,
    pub validation_policy_json: String,
    pub security_scan_policies_json: String,
    pub is_deleting: bool,
    pub is_managed: bool,
    pub next_blob_sweep_at: Option<i64>,
    pub next_storage_sweep_at: Option<i64>,
    pub next_federation_announcement_at: Option<i64>,
    pub next_deletion_attempt_at: Option<i64>,
}

impl Account {
    pub fn is_internal_replica(&self) -> bool {
        !self.upstream_peer_hostname.is_empty()
    }

    pub fn is_external_replica(&self) -> bool {
        !self.external_peer_url.is_empty()
    }

    pub fn is_replica(&self) -> bool {
        self.is_internal_replica() || self.is_external_replica()
    }

    pub fn platform_filter(&self) -> PlatformFilter {
        PlatformFilter::from_db_string(&self.platform_filter)
    }

    pub fn gc_policies(&self) -> Result<Vec<GcPolicy>, RegistryV2Error> {
        parse_policies(&self.gc_policies_json)
    }

    pub fn rbac_policies(&self) -> Result<Vec<RbacPolicy>, RegistryV2Error> {
        parse_policies(&self.rbac_policies_json)
    }

    pub fn tag_policies(&self) -> Result<Vec<TagPolicy>, RegistryV2Error> {
        parse_policies(&self.tag_policies_json)
    }

    pub fn validation_policy(&self) -> Result<Option<ValidationPolicy>, RegistryV2Error> {
        if self.validation_policy_json.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&self.validation_policy_json)
            .map(Some)
            .map_err(|err| RegistryV2Error::Internal(format!("cannot parse validation policy: {err}")))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Repo {
    pub id: i64,
    pub account_name: String,
    pub name: String,
    pub next_blob_mount_sweep_at: Option<i64>,
    pub next_manifest_sync_at: Option<i64>,
    pub next_gc_at: Option<i64>,
}

impl Repo {
    /// The repository name as it appears in API paths, `<account>/<repo>`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_name, self.name)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Blob {
    pub id: i64,
    pub account_name: String,
    pub digest: String,
    pub size_bytes: i64,
    /// Empty string = unbacked: the blob is referenced by a replicated
    /// manifest, but its bytes have not been fetched yet.
    pub storage_id: String,
    pub media_type: String,
    pub pushed_at: i64,
    pub next_validation_at: i64,
    pub validation_error_message: String,
    pub can_be_deleted_at: Option<i64>,
}

impl Blob {
    pub fn is_unbacked(&self) -> bool {
        self.storage_id.is_empty()
    }

    pub fn parsed_digest(&self) -> Result<Digest, RegistryV2Error> {
        self.digest.parse()
    }

    /// Media type to use in responses; unbacked blobs inserted before their
    /// referencing manifest was parsed may not have one.
    pub fn safe_media_type(&self) -> &str {
        if self.media_type.is_empty() {
            "application/octet-stream"
        } else {
            &self.media_type
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Manifest {
    pub repo_id: i64,
    pub digest: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub pushed_at: i64,
    pub last_pulled_at: Option<i64>,
    pub next_validation_at: i64,
    pub validation_error_message: String,
    pub labels_json: String,
    pub min_layer_created_at: Option<i64>,
    pub max_layer_created_at: Option<i64>,
}

impl Manifest {
    pub fn labels(&self) -> std::collections::HashMap<String, String> {
        if self.labels_json.is_empty() {
            return Default::default();
        }
        serde_json::from_str(&self.labels_json).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Tag {
    pub repo_id: i64,
    pub name: String,
    pub digest: String,
    pub pushed_at: i64,
    pub last_pulled_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Upload {
    pub repo_id: i64,
    pub uuid: String,
    pub storage_id: String,
    pub size_bytes: i64,
    pub num_chunks: i64,
    /// Serialized running SHA-256 state over all bytes received so far
    /// (hex-encoded), so that any API instance can continue the upload.
    pub hash_state: String,
    pub updated_at: i64,
}

pub const PENDING_REASON_REPLICATION: &str = "replication";

#[derive(Debug, Clone, FromRow)]
pub struct PendingBlob {
    pub account_name: String,
    pub digest: String,
    pub reason: String,
    pub pending_since: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Quota {
    pub auth_tenant_id: String,
    pub max_manifests: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Peer {
    pub hostname: String,
    /// The password we use to authenticate against this peer.
    pub our_password: String,
    /// Hashes of the passwords this peer may use to authenticate against us.
    /// Two slots allow seamless rotation.
    pub their_current_password_hash: String,
    pub their_previous_password_hash: String,
    pub last_peered_at: Option<i64>,
    pub use_for_pull_delegation: bool,
}

pub const VULN_STATUS_PENDING: &str = "Pending";
pub const VULN_STATUS_ERROR: &str = "Error";

#[derive(Debug, Clone, FromRow)]
pub struct SecurityInfo {
    pub repo_id: i64,
    pub digest: String,
    pub vuln_status: String,
    pub message: String,
    pub next_check_at: i64,
    pub checked_at: Option<i64>,
    pub has_enriched_report: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_name_shape() {
        assert!(is_account_name("library"));
        assert!(is_account_name("my-team-2"));
        assert!(!is_account_name(""));
        assert!(!is_account_name("UPPER"));
        assert!(!is_account_name("under_score"));
        assert!(!is_account_name("-leading"));
        assert!(!is_account_name(&"a".repeat(49)));
    }

    #[test]
    fn test_reserved_names_refused_at_creation() {
        assert!(validate_new_account_name("library").is_ok());
        assert!(validate_new_account_name("keppel-internal").is_err());
        assert!(validate_new_account_name("keppel").is_err());
        assert!(validate_new_account_name("v1").is_err());
        assert!(validate_new_account_name("v42").is_err());
        // not an API-version lookalike
        assert!(validate_new_account_name("v1x").is_ok());
    }

    #[test]
    fn test_replica_flags() {
        let mut account = Account {
            name: "a".into(),
            auth_tenant_id: "t".into(),
            upstream_peer_hostname: String::new(),
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
        };
        assert!(!account.is_replica());
        account.upstream_peer_hostname = "peer.example.org".into();
        assert!(account.is_internal_replica());
        assert!(!account.is_external_replica());
    }
}
