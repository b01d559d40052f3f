//! Manifest reads, pushes and deletes, plus the tag list endpoint.

use hyper::body::Incoming;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde_json::json;

use super::{accepted_media_types, accepts};
use crate::api::body::{self, Body};
use crate::api::{collect_body, AccountLookup, Api, DOCKER_CONTENT_DIGEST};
use crate::auth::{Audience, Scope};
use crate::db::{self, Account, Manifest, Repo};
use crate::drivers::RateLimitedAction;
use crate::errors::RegistryV2Error;
use crate::oci::{Digest, ParsedManifest, Reference};
use crate::processor::manifests::IncomingManifest;

const MANIFEST_SIZE_LIMIT: usize = 8 << 20;

pub async fn handle_query(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    reference: &Reference,
    want_body: bool,
) -> Result<Response<Body>, RegistryV2Error> {
    let (account_name, repo_name) = api.resolve_repo_name(audience, raw_name)?;
    let scope = Scope::repository(raw_name, &["pull"]);
    if let Err(response) = api.registry_authorize(parts, audience, &scope) {
        return Ok(*response);
    }

    let account = match api.find_account_or_forward(&account_name, audience, parts).await? {
        AccountLookup::Local(account) => account,
        AccountLookup::Forwarded(response) => return Ok(*response),
    };

    if !api
        .rld
        .rate_limit_allows(&account.name, RateLimitedAction::PullManifest, 1)
        .await?
    {
        return Err(RegistryV2Error::TooManyRequests);
    }

    let repo = if account.is_replica() {
        db::get_or_create_repo(&api.db, &account.name, &repo_name).await?
    } else {
        db::find_repo(&api.db, &account.name, &repo_name)
            .await?
            .ok_or(RegistryV2Error::NameUnknown)?
    };

    // resolve tag references to a digest
    let digest_str = match reference {
        Reference::Digest(digest) => Some(digest.to_string()),
        Reference::Tag(tag) => db::find_tag(&api.db, repo.id, tag).await?.map(|t| t.digest),
    };

    let manifest = match &digest_str {
        Some(digest_str) => db::find_manifest(&api.db, repo.id, digest_str).await?,
        None => None,
    };

    let (manifest, contents) = match manifest {
        Some(manifest) => {
            let contents = db::find_manifest_content(&api.db, repo.id, &manifest.digest)
                .await?
                .ok_or_else(|| RegistryV2Error::Internal("manifest content missing".into()))?;
            (manifest, contents)
        }
        None if account.is_replica() => {
            let (contents, manifest) = api.processor.replicate_manifest(&account, &repo, reference).await?;
            (manifest, contents)
        }
        None => return Err(RegistryV2Error::ManifestUnknown),
    };

    // alternate serving: a Docker v2 list pulled by a client that only
    // accepts Docker v2 schema 2 is answered with the linux/amd64 child
    let accepted = accepted_media_types(parts);
    let (manifest, contents) = if accepts(&accepted, &manifest.media_type) {
        (manifest, contents)
    } else {
        match find_acceptable_alternate(api, &account, &repo, &manifest, &contents, &accepted).await? {
            Some(alternate) => alternate,
            None => (manifest, contents),
        }
    };

    if want_body {
        let now = api.processor.now();
        let _ = sqlx::query("UPDATE manifests SET last_pulled_at = $1 WHERE repo_id = $2 AND digest = $3")
            .bind(now)
            .bind(repo.id)
            .bind(&manifest.digest)
            .execute(&api.db)
            .await;
        if let Reference::Tag(tag) = reference {
            let _ = sqlx::query("UPDATE tags SET last_pulled_at = $1 WHERE repo_id = $2 AND name = $3")
                .bind(now)
                .bind(repo.id)
                .bind(tag)
                .execute(&api.db)
                .await;
        }
    }

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, &manifest.media_type)
        .header(CONTENT_LENGTH, contents.len())
        .header(DOCKER_CONTENT_DIGEST, &manifest.digest);
    if !want_body {
        return Ok(builder.body(body::empty())?);
    }
    Ok(builder.body(body::fixed(contents))?)
}

async fn find_acceptable_alternate(
    api: &Api,
    account: &Account,
    repo: &Repo,
    manifest: &Manifest,
    contents: &[u8],
    accepted: &[String],
) -> Result<Option<(Manifest, Vec<u8>)>, RegistryV2Error> {
    let Ok(parsed) = ParsedManifest::parse(&manifest.media_type, contents) else {
        return Ok(None);
    };
    for alternate in parsed.acceptable_alternates(&account.platform_filter()) {
        if !accepts(accepted, &alternate.media_type) {
            continue;
        }
        let digest_str = alternate.digest.to_string();
        if let Some(child) = db::find_manifest(&api.db, repo.id, &digest_str).await? {
            if let Some(child_contents) = db::find_manifest_content(&api.db, repo.id, &digest_str).await? {
                return Ok(Some((child, child_contents)));
            }
        }
    }
    Ok(None)
}

pub async fn handle_put(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    reference: Reference,
    request_body: Incoming,
) -> Result<Response<Body>, RegistryV2Error> {
    let (account_name, repo_name) = api.resolve_repo_name(audience, raw_name)?;
    let scope = Scope::repository(raw_name, &["push"]);
    if let Err(response) = api.registry_authorize(parts, audience, &scope) {
        return Ok(*response);
    }

    let account = db::find_account(&api.db, &account_name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;
    if !api
        .rld
        .rate_limit_allows(&account.name, RateLimitedAction::PushManifest, 1)
        .await?
    {
        return Err(RegistryV2Error::TooManyRequests);
    }
    let repo = db::get_or_create_repo(&api.db, &account.name, &repo_name).await?;

    let media_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RegistryV2Error::ManifestInvalid("no Content-Type header provided".into()))?
        .to_string();
    let contents = collect_body(request_body, MANIFEST_SIZE_LIMIT).await?;

    let subject = ParsedManifest::parse(&media_type, &contents)
        .ok()
        .and_then(|parsed| parsed.subject().map(|s| s.digest.to_string()));

    let manifest = api
        .processor
        .validate_and_store_manifest(
            &account,
            &repo,
            IncomingManifest { reference: reference.clone(), media_type, contents },
        )
        .await?;

    let location = format!("/v2/{raw_name}/manifests/{reference}");
    let mut builder = Response::builder()
        .status(StatusCode::CREATED)
        .header(LOCATION, location)
        .header(DOCKER_CONTENT_DIGEST, &manifest.digest);
    if let Some(subject) = subject {
        builder = builder.header("OCI-Subject", subject);
    }
    Ok(builder.body(body::empty())?)
}

pub async fn handle_delete(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    reference: &Reference,
) -> Result<Response<Body>, RegistryV2Error> {
    let (account_name, repo_name) = api.resolve_repo_name(audience, raw_name)?;
    let scope = Scope::repository(raw_name, &["delete"]);
    if let Err(response) = api.registry_authorize(parts, audience, &scope) {
        return Ok(*response);
    }

    let account = db::find_account(&api.db, &account_name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;
    let repo = db::find_repo(&api.db, &account_name, &repo_name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;

    match reference {
        Reference::Digest(digest) => {
            db::find_manifest(&api.db, repo.id, &digest.to_string())
                .await?
                .ok_or(RegistryV2Error::ManifestUnknown)?;
            api.processor.delete_manifest(&account, &repo, digest).await?;
        }
        Reference::Tag(tag) => {
            api.processor.delete_tag(&account, &repo, tag).await?;
        }
    }

    Ok(Response::builder().status(StatusCode::ACCEPTED).body(body::empty())?)
}

const TAGS_PAGE_LIMIT: u64 = 100;

pub async fn handle_list_tags(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    n: Option<u64>,
    last: Option<String>,
) -> Result<Response<Body>, RegistryV2Error> {
    let (account_name, repo_name) = api.resolve_repo_name(audience, raw_name)?;
    let scope = Scope::repository(raw_name, &["pull"]);
    if let Err(response) = api.registry_authorize(parts, audience, &scope) {
        return Ok(*response);
    }

    let account = match api.find_account_or_forward(&account_name, audience, parts).await? {
        AccountLookup::Local(account) => account,
        AccountLookup::Forwarded(response) => return Ok(*response),
    };
    let repo = db::find_repo(&api.db, &account.name, &repo_name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;

    let limit = n.unwrap_or(TAGS_PAGE_LIMIT).clamp(1, TAGS_PAGE_LIMIT);
    let marker = last.unwrap_or_default();

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM tags WHERE repo_id = $1 AND name > $2 ORDER BY name LIMIT $3",
    )
    .bind(repo.id)
    .bind(&marker)
    .bind(limit as i64 + 1)
    .fetch_all(&api.db)
    .await?;

    let mut tags: Vec<String> = rows.into_iter().map(|(name,)| name).collect();
    let partial = tags.len() as u64 > limit;
    tags.truncate(limit as usize);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json");
    if partial {
        if let Some(last_tag) = tags.last() {
            builder = builder.header(
                "Link",
                format!("</v2/{raw_name}/tags/list?n={limit}&last={last_tag}>; rel=\"next\""),
            );
        }
    }
    let payload = json!({ "name": raw_name, "tags": tags });
    Ok(builder.body(body::fixed(serde_json::to_vec(&payload)?))?)
}
