use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::RegistryV2Error;

/// Protects tags in matching repositories from being moved or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPolicy {
    pub match_repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_tag: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub block_overwrite: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub block_delete: bool,
}

impl TagPolicy {
    pub fn validate(&self) -> Result<(), RegistryV2Error> {
        let user_err = |msg: String| RegistryV2Error::ManifestInvalid(msg);

        if self.match_repository.is_empty() {
            return Err(user_err("match_repository must not be empty".into()));
        }
        if !self.block_overwrite && !self.block_delete {
            return Err(user_err("tag policy must block overwrite, delete or both".into()));
        }
        for (field, value) in [
            ("match_repository", Some(&self.match_repository)),
            ("except_repository", self.except_repository.as_ref()),
            ("match_tag", self.match_tag.as_ref()),
        ] {
            if let Some(value) = value {
                Regex::new(value).map_err(|err| user_err(format!("invalid regex in {field:?}: {err}")))?;
            }
        }
        Ok(())
    }

    pub fn matches(&self, repo_name: &str, tag_name: &str) -> bool {
        if !anchored_match(&self.match_repository, repo_name) {
            return false;
        }
        if let Some(except) = &self.except_repository {
            if anchored_match(except, repo_name) {
                return false;
            }
        }
        if let Some(match_tag) = &self.match_tag {
            if !anchored_match(match_tag, tag_name) {
                return false;
            }
        }
        true
    }
}

fn anchored_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}
