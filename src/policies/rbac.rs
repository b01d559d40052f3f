use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::RegistryV2Error;

/// Grants additional permissions on repositories within an account, beyond
/// what the auth tenant membership gives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_username: Option<String>,
    pub permissions: Vec<RbacPermission>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RbacPermission {
    AnonymousPull,
    AnonymousFirstPull,
    Pull,
    Push,
    Delete,
}

impl RbacPolicy {
    pub fn validate(&self, is_replica: bool) -> Result<(), RegistryV2Error> {
        let user_err = |msg: String| RegistryV2Error::ManifestInvalid(msg);

        if self.permissions.is_empty() {
            return Err(user_err("RBAC policy must grant at least one permission".into()));
        }
        for (field, value) in [
            ("match_repository", self.match_repository.as_ref()),
            ("match_username", self.match_username.as_ref()),
        ] {
            if let Some(value) = value {
                Regex::new(value).map_err(|err| user_err(format!("invalid regex in {field:?}: {err}")))?;
            }
        }

        let has_anon = self
            .permissions
            .iter()
            .any(|p| matches!(p, RbacPermission::AnonymousPull | RbacPermission::AnonymousFirstPull));
        if has_anon && self.match_username.is_some() {
            return Err(user_err("anonymous permissions cannot be restricted by username".into()));
        }
        // anonymous_first_pull only makes sense where a first pull triggers
        // replication
        if self.permissions.contains(&RbacPermission::AnonymousFirstPull) && !is_replica {
            return Err(user_err("anonymous_first_pull is only valid on replica accounts".into()));
        }
        Ok(())
    }

    pub fn matches(&self, repo_name: &str, user_name: &str) -> bool {
        if let Some(pattern) = &self.match_repository {
            if !anchored_match(pattern, repo_name) {
                return false;
            }
        }
        if let Some(pattern) = &self.match_username {
            if !anchored_match(pattern, user_name) {
                return false;
            }
        }
        true
    }

    pub fn grants(&self, permission: RbacPermission) -> bool {
        self.permissions.contains(&permission)
    }
}

fn anchored_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_pull_policy() {
        let policy = RbacPolicy {
            match_repository: Some("public/.*".into()),
            match_username: None,
            permissions: vec![RbacPermission::AnonymousPull],
        };
        assert!(policy.validate(false).is_ok());
        assert!(policy.matches("public/nginx", ""));
        assert!(!policy.matches("private/nginx", ""));
        assert!(policy.grants(RbacPermission::AnonymousPull));
        assert!(!policy.grants(RbacPermission::Push));
    }

    #[test]
    fn test_anonymous_with_username_rejected() {
        let policy = RbacPolicy {
            match_repository: None,
            match_username: Some("alice".into()),
            permissions: vec![RbacPermission::AnonymousPull],
        };
        assert!(policy.validate(false).is_err());
    }

    #[test]
    fn test_anonymous_first_pull_requires_replica() {
        let policy = RbacPolicy {
            match_repository: None,
            match_username: None,
            permissions: vec![RbacPermission::AnonymousFirstPull],
        };
        assert!(policy.validate(false).is_err());
        assert!(policy.validate(true).is_ok());
    }
}
