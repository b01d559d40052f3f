//! `GET /v2/_catalog`, scoped to the accounts the caller may see.

use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde_json::json;

use crate::api::body::{self, Body};
use crate::api::Api;
use crate::auth::{Audience, Scope};
use crate::drivers::auth::{Permission, UserType};
use crate::errors::RegistryV2Error;

const MAX_LIMIT: u64 = 100;

pub async fn handle(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    n: Option<u64>,
    last: Option<String>,
) -> Result<Response<Body>, RegistryV2Error> {
    let scope = Scope::catalog();
    let authz = match api.registry_authorize(parts, audience, &scope) {
        Ok(authz) => authz,
        Err(response) => return Ok(*response),
    };

    let limit = n.unwrap_or(MAX_LIMIT).clamp(1, MAX_LIMIT);

    // on domain-remapped APIs, repository names do not carry the account part
    let include_account_name = audience.account_name.is_empty();

    let marker = last.unwrap_or_default();
    let marker_account = if marker.is_empty() {
        String::new()
    } else if include_account_name {
        match marker.split_once('/') {
            Some((account_name, _)) => account_name.to_string(),
            None => {
                return Err(RegistryV2Error::ManifestInvalid(
                    "invalid value for \"last\": must contain a slash".into(),
                ))
            }
        }
    } else {
        audience.account_name.clone()
    };

    // find the accounts the token's identity may enumerate
    let identity = &authz.user_identity;
    let accounts: Vec<(String, String)> =
        sqlx::query_as("SELECT name, auth_tenant_id FROM accounts ORDER BY name")
            .fetch_all(&api.db)
            .await?;
    let accessible: Vec<String> = accounts
        .into_iter()
        .filter(|(name, tenant)| {
            if !audience.account_name.is_empty() && *name != audience.account_name {
                return false;
            }
            identity.user_type() == UserType::Peer || identity.has_permission(Permission::View, tenant)
        })
        .map(|(name, _)| name)
        .filter(|name| marker_account.is_empty() || *name >= marker_account)
        .collect();

    let mut all_names: Vec<String> = Vec::new();
    let mut partial_result = false;
    for (idx, account_name) in accessible.iter().enumerate() {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM repos WHERE account_name = $1 ORDER BY name")
                .bind(account_name)
                .fetch_all(&api.db)
                .await?;
        let mut names: Vec<String> = rows
            .into_iter()
            .map(|(repo_name,)| {
                if include_account_name {
                    format!("{account_name}/{repo_name}")
                } else {
                    repo_name
                }
            })
            .collect();

        // when paginating, we may start in the middle of the first account
        if idx == 0 && !marker.is_empty() {
            names.retain(|name| *name > marker);
        }
        all_names.extend(names);

        if all_names.len() as u64 > limit {
            all_names.truncate(limit as usize);
            partial_result = true;
            break;
        }
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json");
    if partial_result {
        if let Some(last_name) = all_names.last() {
            builder = builder.header(
                "Link",
                format!("</v2/_catalog?n={limit}&last={last_name}>; rel=\"next\""),
            );
        }
    }

    let payload = json!({ "repositories": all_names });
    Ok(builder.body(body::fixed(serde_json::to_vec(&payload)?))?)
}
