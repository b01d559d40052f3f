//! Issuer key handling for the token service. Operators supply private keys
//! as PEM; the public half is derived here for validation and fingerprinting.
//! Each audience class (normal, anycast) has an ordered key list: index 0
//! signs new tokens, all keys validate existing ones, so keys can be rotated
//! without invalidating tokens in flight.

use ed25519_dalek::pkcs8::DecodePrivateKey as _;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs8::DecodePrivateKey as _;
use rsa::traits::PublicKeyParts as _;
use rsa::RsaPrivateKey;
use sha2::{Digest as _, Sha256};
use std::fmt::{self, Display, Formatter};

#[derive(Debug)]
pub enum KeyError {
    UnsupportedKeyType(String),
}

impl Display for KeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::UnsupportedKeyType(msg) => {
                write!(f, "cannot parse issuer key (expected Ed25519 or RSA private key PEM): {msg}")
            }
        }
    }
}

impl std::error::Error for KeyError {}

/// A private signing key plus everything derived from it that token issuance
/// and validation need.
pub struct IssuerKey {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// Hex-encoded SHA-256 over the public key bytes; carried in the JWT
    /// `kid` header so validation can select the right key.
    fingerprint: String,
}

impl IssuerKey {
    /// Parses an Ed25519 (PKCS#8) or RSA (PKCS#1 or PKCS#8) private key PEM.
    pub fn from_private_key_pem(pem: &str) -> Result<Self, KeyError> {
        if let Ok(signing_key) = SigningKey::from_pkcs8_pem(pem) {
            let public_bytes = signing_key.verifying_key().to_bytes();
            return Ok(IssuerKey {
                algorithm: Algorithm::EdDSA,
                encoding_key: EncodingKey::from_ed_pem(pem.as_bytes())
                    .map_err(|err| KeyError::UnsupportedKeyType(err.to_string()))?,
                decoding_key: DecodingKey::from_ed_der(&public_bytes),
                fingerprint: fingerprint_of(&public_bytes),
            });
        }

        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|err| KeyError::UnsupportedKeyType(err.to_string()))?;
        let public_key = private_key.to_public_key();
        let modulus = public_key.n().to_bytes_be();
        let exponent = public_key.e().to_bytes_be();

        let mut public_bytes = modulus.clone();
        public_bytes.extend_from_slice(&exponent);

        Ok(IssuerKey {
            algorithm: Algorithm::RS256,
            encoding_key: EncodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|err| KeyError::UnsupportedKeyType(err.to_string()))?,
            decoding_key: DecodingKey::from_rsa_raw_components(&modulus, &exponent),
            fingerprint: fingerprint_of(&public_bytes),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint_of(public_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::EncodePrivateKey as _;
    use rand::rngs::OsRng;

    /// Generates a fresh Ed25519 issuer key PEM for tests.
    pub fn generate_ed25519_pem() -> String {
        let signing_key = SigningKey::generate(&mut OsRng);
        signing_key
            .to_pkcs8_pem(ed25519_dalek::pkcs8::LineEnding::LF)
            .expect("failed to encode test key")
            .to_string()
    }

    #[test]
    fn test_parse_ed25519_key() {
        let pem = generate_ed25519_pem();
        let key = IssuerKey::from_private_key_pem(&pem).unwrap();
        assert_eq!(key.algorithm(), Algorithm::EdDSA);
        assert_eq!(key.fingerprint().len(), 64);
    }

    #[test]
    fn test_distinct_keys_have_distinct_fingerprints() {
        let key1 = IssuerKey::from_private_key_pem(&generate_ed25519_pem()).unwrap();
        let key2 = IssuerKey::from_private_key_pem(&generate_ed25519_pem()).unwrap();
        assert_ne!(key1.fingerprint(), key2.fingerprint());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(IssuerKey::from_private_key_pem("not a pem").is_err());
    }
}
