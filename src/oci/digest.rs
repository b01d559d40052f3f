use lazy_static::lazy_static;
use regex::Regex;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest as Sha256Digest, Sha256};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::errors::RegistryV2Error;

lazy_static! {
    static ref DIGEST_REGEX: Regex =
        Regex::new(r"^(?P<algorithm>[a-z0-9]+):(?P<hash>[a-f0-9]{64})$").unwrap();
}

/// A content digest in the `<algorithm>:<hex>` form used on the wire.
///
/// Only SHA-256 is supported; any other algorithm is rejected at parse time.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Digest {
    Sha256(String),
}

impl Digest {
    /// Computes the digest of the given bytes.
    pub fn of_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Digest::Sha256(hex::encode(hasher.finalize()))
    }

    pub fn algorithm(&self) -> &str {
        match self {
            Digest::Sha256(_) => "sha256",
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            Digest::Sha256(s) => s,
        }
    }
}

impl FromStr for Digest {
    type Err = RegistryV2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = DIGEST_REGEX.captures(s).ok_or(RegistryV2Error::DigestInvalid)?;
        match &captures["algorithm"] {
            "sha256" => Ok(Digest::Sha256(captures["hash"].to_string())),
            _ => Err(RegistryV2Error::Unsupported),
        }
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.hash())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Digest, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestVisitor;

        impl Visitor<'_> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
                formatter.write_str("a valid digest string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Digest, E>
            where
                E: DeError,
            {
                Digest::from_str(value).map_err(DeError::custom)
            }
        }

        deserializer.deserialize_str(DigestVisitor)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_digest() {
        let s = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let digest = Digest::from_str(s).unwrap();
        assert_eq!(digest.to_string(), s);
        assert_eq!(digest.algorithm(), "sha256");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Digest::from_str("not-a-digest"), Err(RegistryV2Error::DigestInvalid));
        assert_eq!(Digest::from_str("sha256:tooshort"), Err(RegistryV2Error::DigestInvalid));
    }

    #[test]
    fn test_parse_rejects_unknown_algorithm() {
        let s = "sha512:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(Digest::from_str(s), Err(RegistryV2Error::Unsupported));
    }

    #[test]
    fn test_of_bytes_matches_known_vector() {
        // sha256 of the empty string
        assert_eq!(
            Digest::of_bytes(b"").to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let digest = Digest::of_bytes(b"hello world");
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
    }
}
