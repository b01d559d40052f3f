//! Account-level policy types. These are stored as JSON blobs on the account
//! row and evaluated by the API (RBAC, tag policies) and the janitor (GC
//! policies, validation policy).

mod gc;
mod rbac;
mod tag;

pub use gc::{GcAction, GcPolicy, ManifestInfo, TimeConstraint};
pub use rbac::{RbacPermission, RbacPolicy};
pub use tag::TagPolicy;

use serde::{Deserialize, Serialize};

use crate::errors::RegistryV2Error;

/// Constraints that pushed manifests must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_labels: Vec<String>,
}

impl ValidationPolicy {
    pub fn check_labels(&self, labels: &std::collections::HashMap<String, String>) -> Result<(), RegistryV2Error> {
        let missing: Vec<&str> = self
            .required_labels
            .iter()
            .filter(|l| !labels.contains_key(l.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryV2Error::ManifestInvalid(format!(
                "missing required labels: {}",
                missing.join(", ")
            )))
        }
    }
}

pub fn parse_policies<T: serde::de::DeserializeOwned>(json: &str) -> Result<Vec<T>, RegistryV2Error> {
    if json.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json).map_err(|err| RegistryV2Error::Internal(format!("cannot parse policy JSON: {err}")))
}
