//! HTTP surface: the OCI Distribution API (`/v2/...`), the Keppel API
//! (`/keppel/v1/...`) and the anycast forwarding path, all on one listener.

pub mod anycast;
pub mod body;
pub mod keppel;
pub mod registry;
pub mod router;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures_util::TryStreamExt as _;
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::auth::{self, token::parse_token, Audience, Authorization, Scope};
use crate::configuration::Configuration;
use crate::db::{self, DbPool};
use crate::drivers::auth::{AnonymousIdentity, PeerIdentity, UserIdentity};
use crate::drivers::{AuthDriver, FederationDriver, RateLimitDriver, StorageDriver};
use crate::errors::RegistryV2Error;
use crate::metrics;
use crate::processor::Processor;
use body::Body;
use router::Route;

pub const API_VERSION_HEADER_NAME: &str = "Docker-Distribution-Api-Version";
pub const API_VERSION_HEADER_VALUE: &str = "registry/2.0";
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

pub struct Api {
    pub db: DbPool,
    pub config: Arc<Configuration>,
    pub ad: Arc<dyn AuthDriver>,
    pub sd: Arc<dyn StorageDriver>,
    pub fd: Arc<dyn FederationDriver>,
    pub rld: Arc<dyn RateLimitDriver>,
    pub processor: Processor,
}

impl Api {
    pub fn new(
        db: DbPool,
        config: Arc<Configuration>,
        ad: Arc<dyn AuthDriver>,
        sd: Arc<dyn StorageDriver>,
        fd: Arc<dyn FederationDriver>,
        rld: Arc<dyn RateLimitDriver>,
    ) -> Arc<Self> {
        let processor = Processor::new(db.clone(), sd.clone(), fd.clone(), config.clone());
        Arc::new(Api { db, config, ad, sd, fd, rld, processor })
    }

    /// Top-level request handler; never fails, all errors become responses.
    pub async fn handle(self: &Arc<Self>, request: Request<Incoming>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => error_response(&error),
        };
        debug!("{} {} -> {}", method, path, response.status());
        response
    }

    async fn dispatch(&self, request: Request<Incoming>) -> Result<Response<Body>, RegistryV2Error> {
        let (parts, request_body) = request.into_parts();
        let audience = self.audience_of(&parts);
        let route = router::parse(&parts.method, &parts.uri);

        match route {
            Route::Healthz => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(body::fixed("ok"))?),
            Route::Metrics => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(body::fixed(metrics::gather()))?),

            Route::ApiVersion => registry::handle_api_version(self, &parts, &audience).await,
            Route::Catalog { n, last } => registry::catalog::handle(self, &parts, &audience, n, last).await,
            Route::ListTags { name, n, last } => {
                registry::manifests::handle_list_tags(self, &parts, &audience, name, n, last).await
            }
            Route::HeadManifest { name, reference } => {
                registry::manifests::handle_query(self, &parts, &audience, name, &reference, false).await
            }
            Route::GetManifest { name, reference } => {
                registry::manifests::handle_query(self, &parts, &audience, name, &reference, true).await
            }
            Route::PutManifest { name, reference } => {
                registry::manifests::handle_put(self, &parts, &audience, name, reference, request_body).await
            }
            Route::DeleteManifest { name, reference } => {
                registry::manifests::handle_delete(self, &parts, &audience, name, &reference).await
            }
            Route::HeadBlob { name, digest } => {
                registry::blobs::handle_query(self, &parts, &audience, name, &digest, false).await
            }
            Route::GetBlob { name, digest } => {
                registry::blobs::handle_query(self, &parts, &audience, name, &digest, true).await
            }
            Route::DeleteBlob { name, digest } => {
                registry::blobs::handle_delete(self, &parts, &audience, name, &digest).await
            }
            Route::StartUpload { name, digest, mount, from } => {
                registry::uploads::handle_start(self, &parts, &audience, name, digest, mount, from, request_body)
                    .await
            }
            Route::GetUpload { name, uuid } => {
                registry::uploads::handle_get(self, &parts, &audience, name, &uuid).await
            }
            Route::PatchUpload { name, uuid } => {
                registry::uploads::handle_patch(self, &parts, &audience, name, &uuid, request_body).await
            }
            Route::PutUpload { name, uuid, digest } => {
                registry::uploads::handle_put(self, &parts, &audience, name, &uuid, &digest, request_body).await
            }
            Route::DeleteUpload { name, uuid } => {
                registry::uploads::handle_delete(self, &parts, &audience, name, &uuid).await
            }

            Route::AuthToken => keppel::auth::handle_get_token(self, &parts, &audience).await,
            Route::Peering => keppel::peering::handle_announcement(self, request_body).await,
            Route::GetAccount { name } => keppel::accounts::handle_get(self, &parts, &audience, name).await,
            Route::PutAccount { name } => {
                keppel::accounts::handle_put(self, &parts, &audience, name, request_body).await
            }
            Route::DeleteAccount { name } => {
                keppel::accounts::handle_delete(self, &parts, &audience, name).await
            }
            Route::PostSublease { name } => {
                keppel::accounts::handle_post_sublease(self, &parts, &audience, name).await
            }
            Route::GetQuota { tenant } => keppel::quotas::handle_get(self, &parts, &audience, tenant).await,
            Route::PutQuota { tenant } => {
                keppel::quotas::handle_put(self, &parts, &audience, tenant, request_body).await
            }

            Route::Unknown => Err(RegistryV2Error::Unsupported),
        }
    }

    /// Determines the request's audience from its Host header.
    pub(crate) fn audience_of(&self, parts: &Parts) -> Audience {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.host())
            .unwrap_or_default();
        let host = host.split(':').next().unwrap_or_default();
        Audience::identify(host, &self.config)
    }

    /// Resolves a raw repository path from the URL into account and repo
    /// names, honoring domain remapping.
    pub(crate) fn resolve_repo_name(
        &self,
        audience: &Audience,
        raw_name: &str,
    ) -> Result<(String, String), RegistryV2Error> {
        auth::split_repository_scope(raw_name, audience).ok_or(RegistryV2Error::NameInvalid)
    }

    /// Validates the request's bearer token and checks that it grants all the
    /// actions of the given scope. On failure, the prebuilt error response
    /// carries the auth challenge that tells the client where to get a token.
    pub(crate) fn registry_authorize(
        &self,
        parts: &Parts,
        audience: &Audience,
        scope: &Scope,
    ) -> Result<Authorization, Box<Response<Body>>> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(token) = token else {
            return Err(Box::new(self.challenge_response(audience, Some(scope), None)));
        };

        let authz = match parse_token(&self.config, &self.ad, audience, token) {
            Ok(authz) => authz,
            Err(err) => {
                return Err(Box::new(self.challenge_response(audience, Some(scope), Some(&err.to_string()))));
            }
        };

        for action in &scope.actions {
            if !authz.scope_set.grants(&scope.resource_type, &scope.name, action) {
                return Err(Box::new(self.challenge_response(
                    audience,
                    Some(scope),
                    Some("insufficient_scope"),
                )));
            }
        }
        Ok(authz)
    }

    /// Builds the 401 response with the `WWW-Authenticate` challenge pointing
    /// at our token endpoint.
    pub(crate) fn challenge_response(
        &self,
        audience: &Audience,
        scope: Option<&Scope>,
        error: Option<&str>,
    ) -> Response<Body> {
        let service = audience.hostname(&self.config);
        let mut challenge = format!("Bearer realm=\"https://{service}/keppel/v1/auth\",service=\"{service}\"");
        if let Some(scope) = scope {
            challenge.push_str(&format!(
                ",scope=\"{}:{}:{}\"",
                scope.resource_type,
                scope.name,
                scope.actions.join(",")
            ));
        }
        if let Some(error) = error {
            challenge.push_str(&format!(",error=\"{error}\""));
        }

        let err = RegistryV2Error::Unauthorized("authentication required".into());
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(API_VERSION_HEADER_NAME, API_VERSION_HEADER_VALUE)
            .header("WWW-Authenticate", challenge)
            .header(CONTENT_TYPE, "application/json")
            .body(body::fixed(err.to_json()))
            .expect("static response construction cannot fail")
    }

    /// Resolves the identity behind the Basic credentials of a token request:
    /// a peer's replication user, a driver-authenticated user, or anonymous.
    pub(crate) async fn identify_basic_auth(
        &self,
        parts: &Parts,
    ) -> Result<Arc<dyn UserIdentity>, RegistryV2Error> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "));
        let Some(header) = header else {
            return Ok(Arc::new(AnonymousIdentity));
        };

        let decoded = BASE64_STANDARD
            .decode(header)
            .map_err(|_| RegistryV2Error::Unauthorized("malformed credentials".into()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| RegistryV2Error::Unauthorized("malformed credentials".into()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| RegistryV2Error::Unauthorized("malformed credentials".into()))?;

        if let Some(peer_hostname) = username.strip_prefix("replication@") {
            let peer = db::find_peer(&self.db, peer_hostname)
                .await?
                .ok_or_else(|| RegistryV2Error::Unauthorized("unknown peer".into()))?;
            let password_hash = hex::encode(Sha256::digest(password.as_bytes()));
            if password_hash != peer.their_current_password_hash
                && password_hash != peer.their_previous_password_hash
            {
                return Err(RegistryV2Error::Unauthorized("wrong credentials".into()));
            }
            return Ok(Arc::new(PeerIdentity { peer_hostname: peer_hostname.to_string() }));
        }

        self.ad.authenticate_user(username, password).await
    }

}

/// The outcome of looking up an account that may live on another peer.
pub(crate) enum AccountLookup {
    Local(db::Account),
    /// The request was reverse-proxied to the primary's peer; this is the
    /// final response.
    Forwarded(Box<Response<Body>>),
}

impl Api {
    /// Finds the account locally, or forwards an anycast request to the peer
    /// hosting the primary account. A request that was already forwarded once
    /// is never forwarded again.
    pub(crate) async fn find_account_or_forward(
        &self,
        account_name: &str,
        audience: &Audience,
        parts: &Parts,
    ) -> Result<AccountLookup, RegistryV2Error> {
        if let Some(account) = db::find_account(&self.db, account_name).await? {
            return Ok(AccountLookup::Local(account));
        }

        if audience.is_anycast && !anycast::was_forwarded(parts) {
            let primary = self
                .fd
                .find_primary_account(account_name)
                .await
                .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;
            if let Some(peer_hostname) = primary {
                if peer_hostname != self.config.api_public_hostname {
                    let response =
                        anycast::reverse_proxy_to_peer(&self.config, audience, parts, &peer_hostname).await?;
                    return Ok(AccountLookup::Forwarded(Box::new(response)));
                }
            }
        }

        Err(RegistryV2Error::NameUnknown)
    }
}

/// Renders an error in the OCI error body format.
pub fn error_response(error: &RegistryV2Error) -> Response<Body> {
    Response::builder()
        .status(error.status())
        .header(API_VERSION_HEADER_NAME, API_VERSION_HEADER_VALUE)
        .header(CONTENT_TYPE, "application/json")
        .body(body::fixed(error.to_json()))
        .expect("static response construction cannot fail")
}

/// Adapts a request body into an `AsyncRead` for the upload paths.
pub(crate) fn body_reader(request_body: Incoming) -> impl tokio::io::AsyncRead + Send + Unpin + 'static {
    let stream = http_body_util::BodyStream::new(request_body)
        .map_ok(|frame| frame.into_data().unwrap_or_default())
        .map_err(|err| std::io::Error::other(err.to_string()));
    tokio_util::io::StreamReader::new(stream)
}

/// Buffers a request body, for the JSON endpoints and manifest pushes.
pub(crate) async fn collect_body(request_body: Incoming, limit: usize) -> Result<Vec<u8>, RegistryV2Error> {
    use http_body_util::BodyExt;
    let collected = request_body.collect().await.map_err(|err| {
        RegistryV2Error::Internal(format!("cannot read request body: {err}"))
    })?;
    let bytes = collected.to_bytes();
    if bytes.len() > limit {
        return Err(RegistryV2Error::SizeInvalid);
    }
    Ok(bytes.to_vec())
}
