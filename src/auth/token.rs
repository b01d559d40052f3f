//! Issuing and validating bearer tokens. Tokens are JWTs signed with the
//! audience's current issuer key; the `kid` header carries the signing key's
//! fingerprint so validation can pick the right key during rotation.

use chrono::Utc;
use jsonwebtoken::{decode, decode_header, encode, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{Audience, Authorization, Scope, ScopeSet};
use crate::configuration::Configuration;
use crate::drivers::auth::{AnonymousIdentity, AuthDriver, PeerIdentity, UserIdentity};
use crate::errors::RegistryV2Error;

/// Default token lifetime.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 4 * 3600;
/// Shorter lifetime for tokens handed to the security scanner.
pub const SCANNER_EXPIRES_IN_SECS: u64 = 20 * 60;

const LEEWAY_SECS: u64 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    iss: String,
    aud: String,
    sub: String,
    jti: String,
    iat: i64,
    nbf: i64,
    exp: i64,
    access: Vec<Scope>,
    /// Embedded user identity as a one-entry map `{plugin_type_id: payload}`.
    kea: serde_json::Value,
}

/// The auth endpoint's response format, as expected by docker clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: u64,
    pub issued_at: String,
}

impl Authorization {
    pub fn issue_token(&self, config: &Configuration) -> Result<TokenResponse, RegistryV2Error> {
        self.issue_token_with_expiry(config, DEFAULT_EXPIRES_IN_SECS)
    }

    pub fn issue_token_with_expiry(
        &self,
        config: &Configuration,
        expires_in_secs: u64,
    ) -> Result<TokenResponse, RegistryV2Error> {
        let issuer_keys = self.audience.issuer_keys(config);
        let Some(issuer_key) = issuer_keys.first() else {
            return Err(RegistryV2Error::Internal("no issuer keys configured for this audience".into()));
        };

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(expires_in_secs as i64);

        // the issuer names the concrete API that issued the token, even for
        // anycast tokens that any peer may validate
        let issuer_audience = Audience {
            is_anycast: false,
            account_name: self.audience.account_name.clone(),
        };

        let identity = &self.user_identity;
        let claims = TokenClaims {
            iss: format!("keppel-api@{}", issuer_audience.hostname(config)),
            aud: self.audience.hostname(config),
            sub: identity.user_name(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            // slightly in the past to tolerate clock skew between issuer and user
            nbf: now.timestamp() - 1,
            exp: expires_at.timestamp(),
            access: self.scope_set.clone().into_vec(),
            kea: serde_json::json!({ identity.plugin_type_id(): identity.serialize_to_json() }),
        };

        let mut header = Header::new(issuer_key.algorithm());
        header.kid = Some(issuer_key.fingerprint().to_string());

        let token = encode(&header, &claims, issuer_key.encoding_key())
            .map_err(|err| RegistryV2Error::Internal(format!("cannot sign token: {err}")))?;

        Ok(TokenResponse {
            token,
            expires_in: expires_in_secs,
            issued_at: now.to_rfc3339(),
        })
    }
}

/// Validates a bearer token for the given audience and rehydrates the
/// embedded user identity.
pub fn parse_token(
    config: &Configuration,
    auth_driver: &Arc<dyn AuthDriver>,
    audience: &Audience,
    token_str: &str,
) -> Result<Authorization, RegistryV2Error> {
    let unauthorized = |msg: String| RegistryV2Error::Unauthorized(msg);

    let header = decode_header(token_str).map_err(|err| unauthorized(err.to_string()))?;
    let kid = header.kid.as_deref().unwrap_or_default();

    let issuer_key = audience
        .issuer_keys(config)
        .iter()
        .find(|key| key.fingerprint() == kid)
        .ok_or_else(|| unauthorized("token signed by unknown key".into()))?;
    if header.alg != issuer_key.algorithm() {
        return Err(unauthorized(format!("unexpected signing method: {:?}", header.alg)));
    }

    let hostname = audience.hostname(config);
    let mut validation = Validation::new(issuer_key.algorithm());
    validation.leeway = LEEWAY_SECS;
    validation.validate_nbf = true;
    validation.set_audience(&[&hostname]);
    if !audience.is_anycast {
        validation.set_issuer(&[format!("keppel-api@{hostname}")]);
    }
    // For anycast tokens, the issuer is not checked: any of our peers could
    // have issued the token with the shared anycast key set.

    let data = decode::<TokenClaims>(token_str, issuer_key.decoding_key(), &validation)
        .map_err(|err| unauthorized(err.to_string()))?;

    let user_identity = decode_embedded_identity(auth_driver, &data.claims.kea)?;
    let scope_set = data.claims.access.into_iter().collect();

    Ok(Authorization {
        user_identity,
        scope_set,
        audience: audience.clone(),
    })
}

fn decode_embedded_identity(
    auth_driver: &Arc<dyn AuthDriver>,
    kea: &serde_json::Value,
) -> Result<Arc<dyn UserIdentity>, RegistryV2Error> {
    let map = kea
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| RegistryV2Error::Unauthorized("malformed embedded identity".into()))?;
    let (type_id, payload) = map.iter().next().expect("len was checked above");

    match type_id.as_str() {
        "anon" => Ok(Arc::new(AnonymousIdentity)),
        "peer" => {
            let hostname = payload
                .as_str()
                .ok_or_else(|| RegistryV2Error::Unauthorized("malformed embedded peer identity".into()))?;
            Ok(Arc::new(PeerIdentity { peer_hostname: hostname.to_string() }))
        }
        other if other == auth_driver.plugin_type_id() => auth_driver.deserialize_user_identity(payload),
        other => Err(RegistryV2Error::Unauthorized(format!(
            "cannot deserialize embedded identity of type {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::tests::generate_ed25519_pem;
    use crate::auth::keys::IssuerKey;
    use crate::configuration::StaticUser;
    use crate::drivers::auth::StaticAuthDriver;

    fn config_with_keys() -> Configuration {
        Configuration {
            api_public_hostname: "registry.example.org".into(),
            anycast_api_public_hostname: Some("registry.global.example.org".into()),
            listen_address: "127.0.0.1:0".parse().unwrap(),
            database_url: "sqlite::memory:".into(),
            issuer_keys: vec![IssuerKey::from_private_key_pem(&generate_ed25519_pem()).unwrap()],
            anycast_issuer_keys: vec![IssuerKey::from_private_key_pem(&generate_ed25519_pem()).unwrap()],
            auth_driver: "static".into(),
            storage_driver: "in-memory".into(),
            federation_driver: "trivial".into(),
            rate_limit_driver: None,
            storage_path: None,
            federation_path: None,
            static_users: Vec::new(),
            peers: Vec::new(),
            trivy_url: None,
        }
    }

    fn auth_driver() -> Arc<dyn AuthDriver> {
        Arc::new(StaticAuthDriver::new(vec![StaticUser {
            username: "alice".into(),
            password: "secret".into(),
            auth_tenant_id: "tenant1".into(),
            permissions: vec!["view".into(), "pull".into(), "push".into()],
        }]))
    }

    async fn authorization(driver: &Arc<dyn AuthDriver>, audience: Audience) -> Authorization {
        let identity = driver.authenticate_user("alice", "secret").await.unwrap();
        let mut scope_set = ScopeSet::default();
        scope_set.add(Scope::repository("library/alpine", &["pull", "push"]));
        Authorization { user_identity: identity, scope_set, audience }
    }

    #[tokio::test]
    async fn test_issue_and_parse_token() {
        let config = config_with_keys();
        let driver = auth_driver();
        let authz = authorization(&driver, Audience::default()).await;

        let response = authz.issue_token(&config).unwrap();
        assert_eq!(response.expires_in, DEFAULT_EXPIRES_IN_SECS);

        let parsed = parse_token(&config, &driver, &Audience::default(), &response.token).unwrap();
        assert_eq!(parsed.user_name(), "alice");
        assert!(parsed.scope_set.grants("repository", "library/alpine", "pull"));
        assert!(parsed.scope_set.grants("repository", "library/alpine", "push"));
        assert!(!parsed.scope_set.grants("repository", "library/alpine", "delete"));
    }

    #[tokio::test]
    async fn test_token_for_wrong_audience_rejected() {
        let config = config_with_keys();
        let driver = auth_driver();
        let authz = authorization(&driver, Audience::default()).await;
        let response = authz.issue_token(&config).unwrap();

        let anycast = Audience { is_anycast: true, account_name: String::new() };
        assert!(parse_token(&config, &driver, &anycast, &response.token).is_err());
    }

    #[tokio::test]
    async fn test_token_signed_by_rotated_out_key_rejected() {
        let mut config = config_with_keys();
        let driver = auth_driver();
        let authz = authorization(&driver, Audience::default()).await;
        let response = authz.issue_token(&config).unwrap();

        config.issuer_keys = vec![IssuerKey::from_private_key_pem(&generate_ed25519_pem()).unwrap()];
        let err = parse_token(&config, &driver, &Audience::default(), &response.token).unwrap_err();
        assert!(err.to_string().contains("unknown key"));
    }

    #[tokio::test]
    async fn test_token_survives_key_rotation() {
        let mut config = config_with_keys();
        let driver = auth_driver();
        let authz = authorization(&driver, Audience::default()).await;
        let response = authz.issue_token(&config).unwrap();

        // rotate: a new key signs, the old one stays in the validation list
        let old_key = config.issuer_keys.remove(0);
        config.issuer_keys = vec![
            IssuerKey::from_private_key_pem(&generate_ed25519_pem()).unwrap(),
            old_key,
        ];
        let parsed = parse_token(&config, &driver, &Audience::default(), &response.token).unwrap();
        assert_eq!(parsed.user_name(), "alice");
    }

    #[tokio::test]
    async fn test_anonymous_identity_round_trip() {
        let config = config_with_keys();
        let driver = auth_driver();
        let authz = Authorization {
            user_identity: Arc::new(AnonymousIdentity),
            scope_set: ScopeSet::default(),
            audience: Audience::default(),
        };
        let response = authz.issue_token(&config).unwrap();
        let parsed = parse_token(&config, &driver, &Audience::default(), &response.token).unwrap();
        assert_eq!(parsed.user_name(), "");
    }

    #[tokio::test]
    async fn test_peer_identity_round_trip() {
        let config = config_with_keys();
        let driver = auth_driver();
        let authz = Authorization {
            user_identity: Arc::new(PeerIdentity { peer_hostname: "keppel-2.example.org".into() }),
            scope_set: ScopeSet::default(),
            audience: Audience::default(),
        };
        let response = authz.issue_token(&config).unwrap();
        let parsed = parse_token(&config, &driver, &Audience::default(), &response.token).unwrap();
        assert_eq!(parsed.user_name(), "replication@keppel-2.example.org");
    }
}
