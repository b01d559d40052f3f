//! Blob reads and deletes. A GET for an unbacked blob in a replica account
//! triggers replication on pull: the response streams the bytes while they
//! are simultaneously persisted to local storage.

use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RANGE};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use tokio::io::AsyncReadExt;

use crate::api::body::{self, Body};
use crate::api::{AccountLookup, Api, DOCKER_CONTENT_DIGEST};
use crate::auth::{Audience, Scope};
use crate::db::{self, Blob};
use crate::drivers::RateLimitedAction;
use crate::errors::RegistryV2Error;
use crate::oci::Digest;

pub async fn handle_query(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    digest: &Digest,
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
        .rate_limit_allows(&account.name, RateLimitedAction::PullBlob, 1)
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

    let blob = db::find_blob_in_repo(&api.db, repo.id, &digest.to_string()).await?;

    // HEAD is answered from the database row alone; an unbacked blob is
    // still known to exist with its size
    if !want_body {
        let blob = blob.ok_or(RegistryV2Error::BlobUnknown)?;
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, blob.safe_media_type())
            .header(CONTENT_LENGTH, blob.size_bytes)
            .header(DOCKER_CONTENT_DIGEST, blob.digest.clone())
            .body(body::empty())?);
    }

    match blob {
        Some(blob) if !blob.is_unbacked() => serve_local_blob(api, parts, &account.name, blob).await,
        Some(blob) if account.is_replica() => {
            let replicated = api.processor.replicate_blob(blob, &account, &repo).await?;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, replicated.media_type)
                .header(CONTENT_LENGTH, replicated.size_bytes)
                .header(DOCKER_CONTENT_DIGEST, replicated.digest.to_string())
                .body(body::from_reader(replicated.body))?)
        }
        _ => Err(RegistryV2Error::BlobUnknown),
    }
}

async fn serve_local_blob(
    api: &Api,
    parts: &Parts,
    account_name: &str,
    blob: Blob,
) -> Result<Response<Body>, RegistryV2Error> {
    // backends that can serve the blob directly get to do so
    if let Some(url) = api
        .sd
        .url_for_blob(account_name, &blob.storage_id)
        .await
        .map_err(|err| RegistryV2Error::Internal(err.to_string()))?
    {
        return Ok(Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(LOCATION, url)
            .header(DOCKER_CONTENT_DIGEST, blob.digest.clone())
            .body(body::empty())?);
    }

    let (mut reader, size) = api
        .sd
        .read_blob(account_name, &blob.storage_id)
        .await
        .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;

    // partial reads: only the straightforward `bytes=a-b` / `bytes=a-` forms
    if let Some((start, end)) = parse_range(parts, size) {
        if start >= size {
            return Err(RegistryV2Error::SizeInvalid);
        }
        let mut skip = tokio::io::sink();
        tokio::io::copy(&mut (&mut reader).take(start), &mut skip).await?;
        let length = end - start + 1;
        return Ok(Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(CONTENT_TYPE, blob.safe_media_type())
            .header(CONTENT_LENGTH, length)
            .header("Content-Range", format!("bytes {start}-{end}/{size}"))
            .header(DOCKER_CONTENT_DIGEST, blob.digest.clone())
            .body(body::from_reader(reader.take(length)))?);
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, blob.safe_media_type())
        .header(CONTENT_LENGTH, size)
        .header(DOCKER_CONTENT_DIGEST, blob.digest.clone())
        .body(body::from_reader(reader))?)
}

fn parse_range(parts: &Parts, size: u64) -> Option<(u64, u64)> {
    let value = parts.headers.get(RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        end.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end.min(size.saturating_sub(1))))
}

/// `DELETE /v2/<name>/blobs/<digest>` removes the blob mount from this
/// repository; the blob itself is reclaimed by the blob-sweep once no repo
/// in the account mounts it anymore.
pub async fn handle_delete(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    digest: &Digest,
) -> Result<Response<Body>, RegistryV2Error> {
    let (account_name, repo_name) = api.resolve_repo_name(audience, raw_name)?;
    let scope = Scope::repository(raw_name, &["delete"]);
    if let Err(response) = api.registry_authorize(parts, audience, &scope) {
        return Ok(*response);
    }

    db::find_account(&api.db, &account_name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;
    let repo = db::find_repo(&api.db, &account_name, &repo_name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;
    let blob = db::find_blob(&api.db, &account_name, &digest.to_string())
        .await?
        .ok_or(RegistryV2Error::BlobUnknown)?;

    let deleted = sqlx::query("DELETE FROM blob_mounts WHERE repo_id = $1 AND blob_id = $2")
        .bind(repo.id)
        .bind(blob.id)
        .execute(&api.db)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(RegistryV2Error::BlobUnknown);
    }

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(body::empty())?)
}
