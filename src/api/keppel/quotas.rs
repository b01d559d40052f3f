//! Quota management: `GET/PUT /keppel/v1/quotas/<tenant>`.

use hyper::body::Incoming;
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::caller_identity;
use crate::api::body::{self, Body};
use crate::api::{collect_body, Api};
use crate::auth::Audience;
use crate::db;
use crate::drivers::auth::Permission;
use crate::errors::RegistryV2Error;

#[derive(Deserialize)]
struct QuotaEnvelope {
    manifests: QuotaBody,
}

#[derive(Deserialize)]
struct QuotaBody {
    quota: i64,
}

async fn render_quota(api: &Api, tenant: &str) -> Result<Vec<u8>, RegistryV2Error> {
    let quota = db::find_quota(&api.db, tenant).await?.map_or(0, |q| q.max_manifests);
    let usage = db::manifest_count_for_tenant(&api.db, tenant).await?;
    Ok(serde_json::to_vec(&json!({
        "manifests": { "quota": quota, "usage": usage }
    }))?)
}

pub async fn handle_get(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    tenant: &str,
) -> Result<Response<Body>, RegistryV2Error> {
    let identity = caller_identity(api, parts, audience).await?;
    if !identity.has_permission(Permission::ViewQuota, tenant) {
        return Err(RegistryV2Error::Denied("no permission to view quotas for this tenant".into()));
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::fixed(render_quota(api, tenant).await?))?)
}

pub async fn handle_put(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    tenant: &str,
    request_body: Incoming,
) -> Result<Response<Body>, RegistryV2Error> {
    let identity = caller_identity(api, parts, audience).await?;
    if !identity.has_permission(Permission::ChangeQuota, tenant) {
        return Err(RegistryV2Error::Denied("no permission to change quotas for this tenant".into()));
    }

    let payload = collect_body(request_body, 64 << 10).await?;
    let envelope: QuotaEnvelope = serde_json::from_slice(&payload)
        .map_err(|err| RegistryV2Error::ManifestInvalid(format!("malformed request body: {err}")))?;
    if envelope.manifests.quota < 0 {
        return Err(RegistryV2Error::ManifestInvalid("quota must not be negative".into()));
    }

    let usage = db::manifest_count_for_tenant(&api.db, tenant).await?;
    if envelope.manifests.quota < usage {
        return Err(RegistryV2Error::ManifestInvalid(format!(
            "cannot set quota below current usage ({usage} manifests in use)"
        )));
    }

    sqlx::query(
        "INSERT INTO quotas (auth_tenant_id, max_manifests) VALUES ($1, $2)
         ON CONFLICT (auth_tenant_id) DO UPDATE SET max_manifests = $2",
    )
    .bind(tenant)
    .bind(envelope.manifests.quota)
    .execute(&api.db)
    .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::fixed(render_quota(api, tenant).await?))?)
}
