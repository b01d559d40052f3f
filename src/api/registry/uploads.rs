//! Blob uploads: monolithic POST, chunked sessions (POST/PATCH/PUT/DELETE),
//! and cross-repo blob mounts. The running digest of a chunked upload is kept
//! as serialized hasher state on the upload row, so any API instance can
//! continue a session.

use hyper::body::Incoming;
use hyper::header::{CONTENT_LENGTH, LOCATION, RANGE};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use uuid::Uuid;

use crate::api::body::{self, Body};
use crate::api::{body_reader, Api, DOCKER_CONTENT_DIGEST};
use crate::auth::{Audience, Scope};
use crate::db::{self, Account, Repo, Upload};
use crate::drivers::RateLimitedAction;
use crate::errors::RegistryV2Error;
use crate::oci::Digest;
use crate::processor::blobs::UploadProgress;
use crate::util::HashingReader;

const UPLOAD_UUID_HEADER: &str = "Docker-Upload-UUID";

struct UploadTarget {
    account: Account,
    repo: Repo,
    raw_name: String,
}

/// Shared preamble for all upload endpoints: push authorization plus the
/// is-deleting gate (no new uploads for accounts on their way out).
async fn authorize_upload(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
) -> Result<Result<UploadTarget, Box<Response<Body>>>, RegistryV2Error> {
    let (account_name, repo_name) = api.resolve_repo_name(audience, raw_name)?;
    let scope = Scope::repository(raw_name, &["push"]);
    if let Err(response) = api.registry_authorize(parts, audience, &scope) {
        return Ok(Err(response));
    }

    let account = db::find_account(&api.db, &account_name)
        .await?
        .ok_or(RegistryV2Error::NameUnknown)?;
    if account.is_deleting {
        return Err(RegistryV2Error::Denied("account is being deleted".into()));
    }
    if !api
        .rld
        .rate_limit_allows(&account.name, RateLimitedAction::PushBlob, 1)
        .await?
    {
        return Err(RegistryV2Error::TooManyRequests);
    }

    let repo = db::get_or_create_repo(&api.db, &account.name, &repo_name).await?;
    Ok(Ok(UploadTarget { account, repo, raw_name: raw_name.to_string() }))
}

fn content_length(parts: &Parts) -> Option<u64> {
    parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_start(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    digest: Option<Digest>,
    mount: Option<Digest>,
    from: Option<String>,
    request_body: Incoming,
) -> Result<Response<Body>, RegistryV2Error> {
    let target = match authorize_upload(api, parts, audience, raw_name).await? {
        Ok(target) => target,
        Err(response) => return Ok(*response),
    };

    // cross-repo mount: link an existing account-level blob into this repo
    if let Some(mount_digest) = mount {
        if let Some(response) = try_cross_repo_mount(api, &target, &mount_digest, from.as_deref()).await? {
            return Ok(response);
        }
        // blob not found: fall through to opening a regular session, as the
        // distribution spec prescribes
    }

    // monolithic one-shot upload
    if let Some(digest) = digest {
        let mut progress = UploadProgress::new();
        let mut hashing = HashingReader::new(body_reader(request_body));
        let length = content_length(parts);

        api.processor
            .append_to_blob(&target.account.name, &mut progress, &mut hashing, length)
            .await?;
        api.sd
            .finalize_blob(&target.account.name, &progress.storage_id, progress.num_chunks)
            .await
            .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;

        if hashing.digest() != digest {
            let _ = api
                .sd
                .delete_blob(&target.account.name, &progress.storage_id)
                .await;
            return Err(RegistryV2Error::DigestInvalid);
        }

        api.processor
            .commit_uploaded_blob(&target.account, &target.repo, &digest, &progress, "application/octet-stream")
            .await?;

        return Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header(LOCATION, format!("/v2/{}/blobs/{}", target.raw_name, digest))
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .body(body::empty())?);
    }

    // open a chunked upload session
    let upload = Upload {
        repo_id: target.repo.id,
        uuid: Uuid::new_v4().to_string(),
        storage_id: crate::drivers::storage::generate_storage_id(),
        size_bytes: 0,
        num_chunks: 0,
        hash_state: String::new(),
        updated_at: api.processor.now(),
    };
    sqlx::query(
        "INSERT INTO uploads (repo_id, uuid, storage_id, size_bytes, num_chunks, hash_state, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(upload.repo_id)
    .bind(&upload.uuid)
    .bind(&upload.storage_id)
    .bind(upload.size_bytes)
    .bind(upload.num_chunks)
    .bind(&upload.hash_state)
    .bind(upload.updated_at)
    .execute(&api.db)
    .await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, format!("/v2/{}/blobs/uploads/{}", target.raw_name, upload.uuid))
        .header(UPLOAD_UUID_HEADER, &upload.uuid)
        .header(RANGE, "0-0")
        .body(body::empty())?)
}

async fn try_cross_repo_mount(
    api: &Api,
    target: &UploadTarget,
    digest: &Digest,
    from: Option<&str>,
) -> Result<Option<Response<Body>>, RegistryV2Error> {
    let Some(blob) = db::find_blob(&api.db, &target.account.name, &digest.to_string()).await? else {
        return Ok(None);
    };

    // the source repo, when given, must actually contain the blob
    if let Some(from) = from {
        let source_repo_name = match from.strip_prefix(&format!("{}/", target.account.name)) {
            Some(repo_name) => repo_name,
            None => from,
        };
        let Some(source_repo) = db::find_repo(&api.db, &target.account.name, source_repo_name).await? else {
            return Ok(None);
        };
        if db::find_blob_in_repo(&api.db, source_repo.id, &digest.to_string())
            .await?
            .is_none()
        {
            return Ok(None);
        }
    }

    db::mount_blob(&api.db, blob.id, target.repo.id).await?;
    Ok(Some(
        Response::builder()
            .status(StatusCode::CREATED)
            .header(LOCATION, format!("/v2/{}/blobs/{}", target.raw_name, digest))
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .body(body::empty())?,
    ))
}

async fn find_upload(api: &Api, repo_id: i64, uuid: &str) -> Result<Upload, RegistryV2Error> {
    db::find_upload(&api.db, repo_id, uuid)
        .await?
        .ok_or(RegistryV2Error::BlobUploadUnknown)
}

fn range_header(upload: &Upload) -> String {
    if upload.size_bytes == 0 {
        "0-0".to_string()
    } else {
        format!("0-{}", upload.size_bytes - 1)
    }
}

pub async fn handle_get(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    uuid: &str,
) -> Result<Response<Body>, RegistryV2Error> {
    let target = match authorize_upload(api, parts, audience, raw_name).await? {
        Ok(target) => target,
        Err(response) => return Ok(*response),
    };
    let upload = find_upload(api, target.repo.id, uuid).await?;

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(UPLOAD_UUID_HEADER, uuid)
        .header(RANGE, range_header(&upload))
        .body(body::empty())?)
}

pub async fn handle_patch(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    uuid: &str,
    request_body: Incoming,
) -> Result<Response<Body>, RegistryV2Error> {
    let target = match authorize_upload(api, parts, audience, raw_name).await? {
        Ok(target) => target,
        Err(response) => return Ok(*response),
    };
    let upload = find_upload(api, target.repo.id, uuid).await?;

    // clients that send Content-Range must continue exactly where they left off
    if let Some(range) = parts.headers.get("Content-Range").and_then(|v| v.to_str().ok()) {
        let declared_start: Option<u64> = range
            .trim_start_matches("bytes ")
            .split('-')
            .next()
            .and_then(|v| v.parse().ok());
        if declared_start != Some(upload.size_bytes as u64) {
            return Err(RegistryV2Error::BlobUploadInvalid(format!(
                "upload resumed at wrong offset (expected {})",
                upload.size_bytes
            )));
        }
    }

    let upload = append_to_upload(api, &target.account, upload, parts, request_body).await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, format!("/v2/{}/blobs/uploads/{}", target.raw_name, uuid))
        .header(UPLOAD_UUID_HEADER, uuid)
        .header(RANGE, range_header(&upload))
        .body(body::empty())?)
}

async fn append_to_upload(
    api: &Api,
    account: &Account,
    upload: Upload,
    parts: &Parts,
    request_body: Incoming,
) -> Result<Upload, RegistryV2Error> {
    let mut progress = UploadProgress {
        storage_id: upload.storage_id.clone(),
        size_bytes: upload.size_bytes as u64,
        num_chunks: upload.num_chunks as u32,
    };

    let mut hashing = HashingReader::with_hash_state(body_reader(request_body), &upload.hash_state)
        .map_err(|_| RegistryV2Error::BlobUploadInvalid("cannot resume upload digest state".into()))?;
    api.processor
        .append_to_blob(&account.name, &mut progress, &mut hashing, content_length(parts))
        .await?;

    let hash_state = hashing.hash_state();
    sqlx::query(
        "UPDATE uploads SET size_bytes = $1, num_chunks = $2, hash_state = $3, updated_at = $4
          WHERE repo_id = $5 AND uuid = $6",
    )
    .bind(progress.size_bytes as i64)
    .bind(progress.num_chunks as i64)
    .bind(&hash_state)
    .bind(api.processor.now())
    .bind(upload.repo_id)
    .bind(&upload.uuid)
    .execute(&api.db)
    .await?;

    Ok(Upload {
        size_bytes: progress.size_bytes as i64,
        num_chunks: progress.num_chunks as i64,
        hash_state,
        ..upload
    })
}

pub async fn handle_put(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    uuid: &str,
    digest: &Digest,
    request_body: Incoming,
) -> Result<Response<Body>, RegistryV2Error> {
    let target = match authorize_upload(api, parts, audience, raw_name).await? {
        Ok(target) => target,
        Err(response) => return Ok(*response),
    };
    let mut upload = find_upload(api, target.repo.id, uuid).await?;

    // a final chunk may ride along with the finalizing request; and an upload
    // with no chunks at all must still materialize (zero-byte blob)
    let final_chunk_length = content_length(parts).unwrap_or(0);
    if final_chunk_length > 0 || upload.num_chunks == 0 {
        upload = append_to_upload(api, &target.account, upload, parts, request_body).await?;
    }

    api.sd
        .finalize_blob(&target.account.name, &upload.storage_id, upload.num_chunks as u32)
        .await
        .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;

    let actual_digest = HashingReader::with_hash_state(tokio::io::empty(), &upload.hash_state)
        .map_err(|_| RegistryV2Error::BlobUploadInvalid("cannot resume upload digest state".into()))?
        .digest();
    if actual_digest != *digest {
        let _ = api.sd.delete_blob(&target.account.name, &upload.storage_id).await;
        sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
            .bind(upload.repo_id)
            .bind(&upload.uuid)
            .execute(&api.db)
            .await?;
        return Err(RegistryV2Error::DigestInvalid);
    }

    let progress = UploadProgress {
        storage_id: upload.storage_id.clone(),
        size_bytes: upload.size_bytes as u64,
        num_chunks: upload.num_chunks as u32,
    };
    api.processor
        .commit_uploaded_blob(&target.account, &target.repo, digest, &progress, "application/octet-stream")
        .await?;

    sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
        .bind(upload.repo_id)
        .bind(&upload.uuid)
        .execute(&api.db)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(LOCATION, format!("/v2/{}/blobs/{}", target.raw_name, digest))
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(body::empty())?)
}

pub async fn handle_delete(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
    raw_name: &str,
    uuid: &str,
) -> Result<Response<Body>, RegistryV2Error> {
    let target = match authorize_upload(api, parts, audience, raw_name).await? {
        Ok(target) => target,
        Err(response) => return Ok(*response),
    };
    let upload = find_upload(api, target.repo.id, uuid).await?;

    if upload.num_chunks > 0 {
        if let Err(err) = api
            .sd
            .abort_blob_upload(&target.account.name, &upload.storage_id, upload.num_chunks as u32)
            .await
        {
            tracing::error!("cannot abort upload {} in storage: {}", upload.uuid, err);
        }
    }
    sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
        .bind(upload.repo_id)
        .bind(&upload.uuid)
        .execute(&api.db)
        .await?;

    Ok(Response::builder().status(StatusCode::NO_CONTENT).body(body::empty())?)
}
