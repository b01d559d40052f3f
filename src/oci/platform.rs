use serde::{Deserialize, Serialize};

/// An OS/architecture specifier as it appears in image index entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Platform {
            architecture: architecture.into(),
            os: os.into(),
            ..Platform::default()
        }
    }
}

/// Restricts which submanifests get replicated when a list manifest is
/// replicated into a replica account. An empty filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformFilter(pub Vec<Platform>);

impl PlatformFilter {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn includes(&self, platform: &Platform) -> bool {
        if self.0.is_empty() {
            return true;
        }
        self.0.iter().any(|p| p == platform)
    }

    /// Database representation: empty string for "no filter", JSON otherwise.
    pub fn to_db_string(&self) -> String {
        if self.0.is_empty() {
            String::new()
        } else {
            serde_json::to_string(self).unwrap_or_default()
        }
    }

    pub fn from_db_string(s: &str) -> Self {
        if s.is_empty() {
            return PlatformFilter::default();
        }
        serde_json::from_str(s).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = PlatformFilter::default();
        assert!(filter.includes(&Platform::new("linux", "amd64")));
        assert!(filter.includes(&Platform::new("windows", "arm64")));
    }

    #[test]
    fn test_nonempty_filter_matches_exactly() {
        let filter = PlatformFilter(vec![Platform::new("linux", "amd64")]);
        assert!(filter.includes(&Platform::new("linux", "amd64")));
        assert!(!filter.includes(&Platform::new("linux", "arm")));

        let mut with_variant = Platform::new("linux", "amd64");
        with_variant.variant = Some("v2".into());
        assert!(!filter.includes(&with_variant));
    }

    #[test]
    fn test_db_string_round_trip() {
        let filter = PlatformFilter(vec![Platform::new("linux", "amd64"), Platform::new("linux", "arm")]);
        let s = filter.to_db_string();
        assert_eq!(PlatformFilter::from_db_string(&s), filter);

        assert_eq!(PlatformFilter::default().to_db_string(), "");
        assert_eq!(PlatformFilter::from_db_string(""), PlatformFilter::default());
    }
}
