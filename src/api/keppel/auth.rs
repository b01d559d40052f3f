//! `GET /keppel/v1/auth`: the token endpoint. Resolves the caller's
//! credentials into an identity, filters the requested scopes down to what
//! that identity may do, and issues a signed bearer token.

use hyper::http::request::Parts;
use hyper::{Response, StatusCode};

use crate::api::body::{self, Body};
use crate::api::{anycast, Api};
use crate::auth::{self, Audience, Authorization, Scope, ScopeSet};
use crate::db;
use crate::errors::RegistryV2Error;

pub async fn handle_get_token(
    api: &Api,
    parts: &Parts,
    request_audience: &Audience,
) -> Result<Response<Body>, RegistryV2Error> {
    let (service, requested) = parse_auth_query(parts);

    // the audience is named by the `service` parameter; without one, the
    // request's own host decides
    let audience = match &service {
        Some(service) => Audience::identify(service, &api.config),
        None => request_audience.clone(),
    };

    // anycast token requests for accounts we do not host are forwarded to
    // the primary, which can actually judge the caller's permissions
    if audience.is_anycast && !anycast::was_forwarded(parts) {
        if let Some(account_name) = first_unknown_account(api, &audience, &requested).await? {
            let primary = api
                .fd
                .find_primary_account(&account_name)
                .await
                .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;
            if let Some(peer_hostname) = primary {
                if peer_hostname != api.config.api_public_hostname {
                    let response =
                        anycast::reverse_proxy_to_peer(&api.config, &audience, parts, &peer_hostname).await?;
                    return Ok(response);
                }
            }
        }
    }

    let identity = api.identify_basic_auth(parts).await?;
    let granted = auth::filter_scopes(&api.db, &audience, &identity, requested).await?;

    let authorization = Authorization {
        user_identity: identity,
        scope_set: granted,
        audience,
    };
    let token_response = authorization.issue_token(&api.config)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::fixed(serde_json::to_vec(&token_response)?))?)
}

/// Pulls `service` and the repeatable `scope` parameters out of the query
/// string.
fn parse_auth_query(parts: &Parts) -> (Option<String>, ScopeSet) {
    let mut service = None;
    let mut scopes = ScopeSet::default();

    for (key, value) in url_query_pairs(parts.uri.query().unwrap_or_default()) {
        match key.as_str() {
            "service" => service = Some(value),
            "scope" => {
                if let Some(scope) = Scope::parse(&value) {
                    scopes.add(scope);
                }
            }
            _ => {}
        }
    }
    (service, scopes)
}

fn url_query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value: String = serde_urlencoded::from_str::<Vec<(String, String)>>(&format!("v={value}"))
                .ok()?
                .into_iter()
                .next()?
                .1;
            Some((key.to_string(), value))
        })
        .collect()
}

/// The account of the first repository scope that does not exist locally.
async fn first_unknown_account(
    api: &Api,
    audience: &Audience,
    requested: &ScopeSet,
) -> Result<Option<String>, RegistryV2Error> {
    for scope in requested.iter() {
        if scope.resource_type != "repository" {
            continue;
        }
        let Some((account_name, _)) = auth::split_repository_scope(&scope.name, audience) else {
            continue;
        };
        if db::find_account(&api.db, &account_name).await?.is_none() {
            return Ok(Some(account_name));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_query_pairs_decodes_percent_escapes() {
        let pairs = url_query_pairs("service=registry.example.org&scope=repository%3Alibrary%2Falpine%3Apull");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].1, "repository:library/alpine:pull");
    }
}
