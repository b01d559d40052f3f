//! Handlers for the Keppel API: token issuance, peering, account and quota
//! management.

pub mod accounts;
pub mod auth;
pub mod peering;
pub mod quotas;

use hyper::http::request::Parts;
use std::sync::Arc;

use super::Api;
use crate::auth::{token::parse_token, Audience};
use crate::drivers::auth::UserIdentity;
use crate::errors::RegistryV2Error;

/// Resolves the caller's identity from either a bearer token or basic
/// credentials. Used by the management endpoints, which check driver
/// permissions directly instead of token scopes.
pub(crate) async fn caller_identity(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
) -> Result<Arc<dyn UserIdentity>, RegistryV2Error> {
    let auth_header = parts
        .headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if let Some(token) = auth_header.strip_prefix("Bearer ") {
        let authz = parse_token(&api.config, &api.ad, audience, token)?;
        return Ok(authz.user_identity);
    }
    api.identify_basic_auth(parts).await
}
