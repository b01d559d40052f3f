use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::errors::RegistryV2Error;
use crate::oci::Digest;

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
}

/// A manifest reference as it appears in `/v2/<name>/manifests/<reference>`:
/// either a tag name or a digest.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    pub fn as_tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }

    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            Reference::Tag(_) => None,
            Reference::Digest(digest) => Some(digest),
        }
    }
}

impl FromStr for Reference {
    type Err = RegistryV2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(digest) = Digest::from_str(s) {
            return Ok(Reference::Digest(digest));
        }
        if TAG_REGEX.is_match(s) {
            return Ok(Reference::Tag(s.to_string()));
        }
        Err(RegistryV2Error::TagInvalid)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => write!(f, "{tag}"),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}
