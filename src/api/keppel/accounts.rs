//! Account management endpoints: `GET/PUT/DELETE /keppel/v1/accounts/<name>`
//! and sublease token issuance.

use hyper::body::Incoming;
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::caller_identity;
use crate::api::body::{self, Body};
use crate::api::{collect_body, Api};
use crate::auth::Audience;
use crate::db::{self, Account};
use crate::drivers::auth::{Permission, UserType};
use crate::errors::RegistryV2Error;
use crate::oci::PlatformFilter;
use crate::policies::{GcPolicy, RbacPolicy, TagPolicy, ValidationPolicy};
use crate::processor::accounts::{AccountRequest, ReplicationPolicy};

const BODY_SIZE_LIMIT: usize = 1 << 20;
const SUBLEASE_TOKEN_HEADER: &str = "X-Keppel-Sublease-Token";

#[derive(Deserialize)]
struct AccountEnvelope {
    account: AccountBody,
}

#[derive(Serialize, Deserialize)]
struct AccountBody {
    auth_tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replication: Option<ReplicationBody>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    gc_policies: Vec<GcPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rbac_policies: Vec<RbacPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tag_policies: Vec<TagPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    validation: Option<ValidationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    platform_filter: Option<PlatformFilter>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "strategy")]
enum ReplicationBody {
    #[serde(rename = "on_first_use")]
    OnFirstUse { upstream: String },
    #[serde(rename = "from_external_on_first_use")]
    FromExternalOnFirstUse { upstream: ExternalUpstream },
}

#[derive(Serialize, Deserialize)]
struct ExternalUpstream {
    url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    password: String,
}

fn render_account(account: &Account) -> Result<serde_json::Value, RegistryV2Error> {
    let replication = if account.is_internal_replica() {
        Some(ReplicationBody::OnFirstUse {
            upstream: account.upstream_peer_hostname.clone(),
        })
    } else if account.is_external_replica() {
        Some(ReplicationBody::FromExternalOnFirstUse {
            upstream: ExternalUpstream {
                url: account.external_peer_url.clone(),
                username: account.external_peer_username.clone(),
                // the password is write-only
                password: String::new(),
            },
        })
    } else {
        None
    };

    let mut rendered = json!({
        "name": account.name,
        "auth_tenant_id": account.auth_tenant_id,
        "gc_policies": account.gc_policies()?,
        "rbac_policies": account.rbac_policies()?,
        "tag_policies": account.tag_policies()?,
        "platform_filter": account.platform_filter(),
    });
    if let Some(replication) = replication {
        rendered["replication"] = serde_json::to_value(&replication)?;
    }
    if let Some(validation) = account.validation_policy()? {
        rendered["validation"] = serde_json::to_value(&validation)?;
    }
    if account.is_deleting {
        rendered["state"] = json!("deleting");
    }
    Ok(json!({ "account": rendered }))
}

pub async fn handle_get(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    name: &str,
) -> Result<Response<Body>, RegistryV2Error> {
    let identity = caller_identity(api, parts, audience).await?;
    let account = db::find_account(&api.db, name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;

    let allowed = identity.user_type() == UserType::Peer
        || identity.has_permission(Permission::View, &account.auth_tenant_id);
    if !allowed {
        return Err(RegistryV2Error::Denied("no permission to view this account".into()));
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::fixed(serde_json::to_vec(&render_account(&account)?)?))?)
}

pub async fn handle_put(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    name: &str,
    request_body: Incoming,
) -> Result<Response<Body>, RegistryV2Error> {
    let identity = caller_identity(api, parts, audience).await?;

    let payload = collect_body(request_body, BODY_SIZE_LIMIT).await?;
    let envelope: AccountEnvelope = serde_json::from_slice(&payload)
        .map_err(|err| RegistryV2Error::ManifestInvalid(format!("malformed request body: {err}")))?;
    let account_body = envelope.account;

    if !identity.has_permission(Permission::Change, &account_body.auth_tenant_id) {
        return Err(RegistryV2Error::Denied("no permission to manage this account".into()));
    }

    let replication = match account_body.replication {
        None => None,
        Some(ReplicationBody::OnFirstUse { upstream }) => {
            Some(ReplicationPolicy::OnFirstUse { upstream_peer_hostname: upstream })
        }
        Some(ReplicationBody::FromExternalOnFirstUse { upstream }) => {
            Some(ReplicationPolicy::FromExternalOnFirstUse {
                url: upstream.url,
                username: upstream.username,
                password: upstream.password,
            })
        }
    };

    let sublease_token_secret = parts
        .headers
        .get(SUBLEASE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let account = api
        .processor
        .create_or_update_account(AccountRequest {
            name: name.to_string(),
            auth_tenant_id: account_body.auth_tenant_id,
            replication,
            gc_policies: account_body.gc_policies,
            rbac_policies: account_body.rbac_policies,
            tag_policies: account_body.tag_policies,
            validation_policy: account_body.validation,
            platform_filter: account_body.platform_filter,
            sublease_token_secret,
        })
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::fixed(serde_json::to_vec(&render_account(&account)?)?))?)
}

pub async fn handle_delete(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    name: &str,
) -> Result<Response<Body>, RegistryV2Error> {
    let identity = caller_identity(api, parts, audience).await?;
    let account = db::find_account(&api.db, name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;
    if !identity.has_permission(Permission::Change, &account.auth_tenant_id) {
        return Err(RegistryV2Error::Denied("no permission to manage this account".into()));
    }

    api.processor.mark_account_for_deletion(name).await?;
    Ok(Response::builder().status(StatusCode::NO_CONTENT).body(body::empty())?)
}

pub async fn handle_post_sublease(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    name: &str,
) -> Result<Response<Body>, RegistryV2Error> {
    let identity = caller_identity(api, parts, audience).await?;
    let account = db::find_account(&api.db, name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;
    if !identity.has_permission(Permission::Change, &account.auth_tenant_id) {
        return Err(RegistryV2Error::Denied("no permission to manage this account".into()));
    }

    let secret = api.processor.issue_sublease_token(&account).await?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::fixed(serde_json::to_vec(&json!({ "sublease_token": secret }))?))?)
}
