use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::duration::Duration;
use crate::errors::RegistryV2Error;

/// A user-defined garbage collection rule. Policies are evaluated in order;
/// `Protect` policies take precedence over `Delete` policies for the same
/// manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcPolicy {
    pub match_repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_tag: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub only_untagged: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub match_labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_constraint: Option<TimeConstraint>,
    pub action: GcAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcAction {
    Delete,
    Protect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConstraint {
    /// Which timestamp the constraint applies to: "pushed_at" or "last_pulled_at".
    pub on: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub older_than: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newer_than: Option<Duration>,
}

/// The facts about one manifest that GC policies are evaluated against.
#[derive(Debug, Clone)]
pub struct ManifestInfo {
    pub repo_name: String,
    pub pushed_at: i64,
    pub last_pulled_at: Option<i64>,
    pub tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl GcPolicy {
    pub fn validate(&self) -> Result<(), RegistryV2Error> {
        let user_err = |msg: String| RegistryV2Error::ManifestInvalid(msg);

        for (field, value) in [
            ("match_repository", Some(&self.match_repository)),
            ("except_repository", self.except_repository.as_ref()),
            ("match_tag", self.match_tag.as_ref()),
            ("except_tag", self.except_tag.as_ref()),
        ] {
            if let Some(value) = value {
                Regex::new(value).map_err(|err| user_err(format!("invalid regex in {field:?}: {err}")))?;
            }
        }
        if self.match_repository.is_empty() {
            return Err(user_err("match_repository must not be empty".into()));
        }
        if self.only_untagged && (self.match_tag.is_some() || self.except_tag.is_some()) {
            return Err(user_err("tag matchers cannot be combined with only_untagged".into()));
        }
        if let Some(tc) = &self.time_constraint {
            if tc.on != "pushed_at" && tc.on != "last_pulled_at" {
                return Err(user_err(format!("invalid time constraint target: {:?}", tc.on)));
            }
            if tc.older_than.is_none() && tc.newer_than.is_none() {
                return Err(user_err("time constraint must specify older_than or newer_than".into()));
            }
        }
        Ok(())
    }

    pub fn matches_repository(&self, repo_name: &str) -> bool {
        if !full_match(&self.match_repository, repo_name) {
            return false;
        }
        if let Some(except) = &self.except_repository {
            if full_match(except, repo_name) {
                return false;
            }
        }
        true
    }

    /// Checks whether this policy applies to the given manifest at time `now`.
    pub fn matches(&self, manifest: &ManifestInfo, now: i64) -> bool {
        if !self.matches_repository(&manifest.repo_name) {
            return false;
        }

        if self.only_untagged && !manifest.tags.is_empty() {
            return false;
        }
        if let Some(match_tag) = &self.match_tag {
            if !manifest.tags.iter().any(|t| full_match(match_tag, t)) {
                return false;
            }
        }
        if let Some(except_tag) = &self.except_tag {
            if manifest.tags.iter().any(|t| full_match(except_tag, t)) {
                return false;
            }
        }

        for (key, value) in &self.match_labels {
            if manifest.labels.get(key) != Some(value) {
                return false;
            }
        }

        if let Some(tc) = &self.time_constraint {
            let timestamp = match tc.on.as_str() {
                "last_pulled_at" => manifest.last_pulled_at.unwrap_or(manifest.pushed_at),
                _ => manifest.pushed_at,
            };
            let age = now.saturating_sub(timestamp);
            if let Some(older_than) = &tc.older_than {
                if age <= older_than.as_secs() as i64 {
                    return false;
                }
            }
            if let Some(newer_than) = &tc.newer_than {
                if age >= newer_than.as_secs() as i64 {
                    return false;
                }
            }
        }

        true
    }
}

fn full_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(repo: &str, tags: &[&str], pushed_at: i64) -> ManifestInfo {
        ManifestInfo {
            repo_name: repo.into(),
            pushed_at,
            last_pulled_at: None,
            tags: tags.iter().map(ToString::to_string).collect(),
            labels: HashMap::new(),
        }
    }

    fn delete_policy(match_repository: &str) -> GcPolicy {
        GcPolicy {
            match_repository: match_repository.into(),
            except_repository: None,
            match_tag: None,
            except_tag: None,
            only_untagged: false,
            match_labels: HashMap::new(),
            time_constraint: None,
            action: GcAction::Delete,
        }
    }

    #[test]
    fn test_repository_matching_is_anchored() {
        let policy = delete_policy("library/.+");
        assert!(policy.matches(&manifest("library/alpine", &[], 0), 100));
        assert!(!policy.matches(&manifest("mylibrary/alpine", &[], 0), 100));
    }

    #[test]
    fn test_only_untagged() {
        let mut policy = delete_policy(".*");
        policy.only_untagged = true;
        assert!(policy.matches(&manifest("foo", &[], 0), 100));
        assert!(!policy.matches(&manifest("foo", &["latest"], 0), 100));
    }

    #[test]
    fn test_time_constraint_older_than() {
        let mut policy = delete_policy(".*");
        policy.time_constraint = Some(TimeConstraint {
            on: "pushed_at".into(),
            older_than: Some(Duration::from_secs(3600)),
            newer_than: None,
        });
        let now = 10_000;
        assert!(policy.matches(&manifest("foo", &[], 1000), now));
        assert!(!policy.matches(&manifest("foo", &[], now - 60), now));
    }

    #[test]
    fn test_except_tag() {
        let mut policy = delete_policy(".*");
        policy.except_tag = Some("stable-.*".into());
        assert!(policy.matches(&manifest("foo", &["v1"], 0), 100));
        assert!(!policy.matches(&manifest("foo", &["v1", "stable-2024"], 0), 100));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let policy = delete_policy("([");
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tag_matcher_with_only_untagged() {
        let mut policy = delete_policy(".*");
        policy.only_untagged = true;
        policy.match_tag = Some("v.*".into());
        assert!(policy.validate().is_err());
    }
}
