//! Clients for outbound registry traffic: pulling from the upstream registry
//! of a replica account (a peer or an external registry), and talking to peer
//! keppel APIs.

pub mod peer;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures_util::StreamExt as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::db::{Account, Peer};
use crate::errors::RegistryV2Error;
use crate::oci::manifest::MANIFEST_MEDIA_TYPES;
use crate::oci::{Digest, Reference};

pub type DownloadedBlob = (Box<dyn AsyncRead + Unpin + Send>, u64);

/// A client scoped to one repository on one upstream registry. Performs the
/// standard docker token dance: on a bearer challenge, it fetches a token
/// from the advertised realm using its basic credentials and retries.
pub struct RepoClient {
    http: reqwest::Client,
    scheme: &'static str,
    host: String,
    /// Repository path on the upstream, e.g. `library/alpine`.
    repo_name: String,
    username: String,
    password: String,
    bearer_token: Mutex<Option<String>>,
}

impl RepoClient {
    /// A client pulling from a peer keppel. Peers authenticate us with our
    /// replication service user.
    pub fn for_peer(peer: &Peer, own_hostname: &str, repo_full_name: &str) -> Self {
        RepoClient {
            http: reqwest::Client::new(),
            scheme: "https",
            host: peer.hostname.clone(),
            repo_name: repo_full_name.to_string(),
            username: format!("replication@{own_hostname}"),
            password: peer.our_password.clone(),
            bearer_token: Mutex::new(None),
        }
    }

    /// A client pulling from the external upstream of an external replica
    /// account. The repo path on the upstream does not contain our account
    /// name.
    pub fn for_external(account: &Account, repo_name: &str) -> Result<Self, RegistryV2Error> {
        let url = account.external_peer_url.trim_end_matches('/');
        let (scheme, host) = match url.split_once("://") {
            Some(("http", host)) => ("http", host),
            Some((_, host)) => ("https", host),
            None => ("https", url),
        };
        // the external peer URL may carry a path prefix, e.g. "registry-1.docker.io/library"
        let (host, prefix) = match host.split_once('/') {
            Some((host, prefix)) => (host, Some(prefix)),
            None => (host, None),
        };
        let repo_name = match prefix {
            Some(prefix) => format!("{prefix}/{repo_name}"),
            None => repo_name.to_string(),
        };
        Ok(RepoClient {
            http: reqwest::Client::new(),
            scheme,
            host: host.to_string(),
            repo_name,
            username: account.external_peer_username.clone(),
            password: account.external_peer_password.clone(),
            bearer_token: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub fn for_test(base_url: &str, repo_name: &str, username: &str, password: &str) -> Self {
        let (scheme, host) = base_url.split_once("://").unwrap();
        RepoClient {
            http: reqwest::Client::new(),
            scheme: if scheme == "http" { "http" } else { "https" },
            host: host.to_string(),
            repo_name: repo_name.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            bearer_token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        accept: &[&str],
    ) -> Result<reqwest::Response, RegistryV2Error> {
        for attempt in 0..2 {
            let mut request = self.http.request(method.clone(), self.url(path));
            for media_type in accept {
                request = request.header(reqwest::header::ACCEPT, *media_type);
            }
            if let Some(token) = self.bearer_token.lock().unwrap().clone() {
                request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
            }

            let response = request.send().await?;
            if response.status() != reqwest::StatusCode::UNAUTHORIZED || attempt == 1 {
                return Ok(response);
            }

            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
                .unwrap_or_default();
            self.fetch_bearer_token(&challenge).await?;
        }
        unreachable!("the second loop iteration always returns")
    }

    async fn fetch_bearer_token(&self, challenge: &str) -> Result<(), RegistryV2Error> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| {
            RegistryV2Error::Unauthorized("upstream returned 401 without a usable bearer challenge".into())
        })?;
        let realm = params
            .get("realm")
            .ok_or_else(|| RegistryV2Error::Unauthorized("bearer challenge without realm".into()))?;

        debug!("fetching bearer token from {realm}");
        let mut request = self.http.get(realm).query(&[(
            "scope",
            format!("repository:{}:pull", self.repo_name),
        )]);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service)]);
        }
        if !self.username.is_empty() {
            let credentials = BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password));
            request = request.header(reqwest::header::AUTHORIZATION, format!("Basic {credentials}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryV2Error::Unauthorized(format!(
                "cannot authenticate with upstream: token endpoint returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenBody {
            #[serde(default)]
            token: String,
            #[serde(default)]
            access_token: String,
        }
        let body: TokenBody = response.json().await?;
        let token = if body.token.is_empty() { body.access_token } else { body.token };
        if token.is_empty() {
            return Err(RegistryV2Error::Unauthorized("token endpoint returned no token".into()));
        }
        *self.bearer_token.lock().unwrap() = Some(token);
        Ok(())
    }

    /// Downloads a manifest, returning its bytes and media type.
    pub async fn download_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String), RegistryV2Error> {
        let path = format!("/v2/{}/manifests/{}", self.repo_name, reference);
        let response = self.request(reqwest::Method::GET, &path, MANIFEST_MEDIA_TYPES).await?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => return Err(RegistryV2Error::ManifestUnknown),
            status => {
                return Err(RegistryV2Error::Internal(format!(
                    "upstream returned {status} while downloading manifest"
                )))
            }
        }

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        Ok((bytes, media_type))
    }

    /// Resolves a manifest reference on the upstream without downloading the
    /// body.
    pub async fn head_manifest(&self, reference: &Reference) -> Result<Option<Digest>, RegistryV2Error> {
        let path = format!("/v2/{}/manifests/{}", self.repo_name, reference);
        let response = self.request(reqwest::Method::HEAD, &path, MANIFEST_MEDIA_TYPES).await?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => return Ok(None),
            status => {
                return Err(RegistryV2Error::Internal(format!(
                    "upstream returned {status} while checking manifest"
                )))
            }
        }
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(digest)
    }

    /// Opens a streaming download of a blob.
    pub async fn download_blob(&self, digest: &Digest) -> Result<DownloadedBlob, RegistryV2Error> {
        let path = format!("/v2/{}/blobs/{}", self.repo_name, digest);
        let response = self.request(reqwest::Method::GET, &path, &[]).await?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => return Err(RegistryV2Error::BlobUnknown),
            status => {
                return Err(RegistryV2Error::Internal(format!(
                    "upstream returned {status} while downloading blob"
                )))
            }
        }

        let length = response.content_length().ok_or_else(|| {
            RegistryV2Error::Internal("upstream blob response carries no Content-Length".into())
        })?;
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|err| std::io::Error::other(err.to_string())));
        Ok((Box::new(StreamReader::new(stream)), length))
    }

    /// Fetches the full tag list, following pagination.
    pub async fn get_tag_list(&self) -> Result<Vec<String>, RegistryV2Error> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Vec<String>,
        }

        let mut all_tags = Vec::new();
        let mut last = String::new();
        loop {
            let mut path = format!("/v2/{}/tags/list?n=1000", self.repo_name);
            if !last.is_empty() {
                path = format!("{path}&last={last}");
            }
            let response = self.request(reqwest::Method::GET, &path, &[]).await?;
            match response.status() {
                status if status.is_success() => {}
                reqwest::StatusCode::NOT_FOUND => return Ok(Vec::new()),
                status => {
                    return Err(RegistryV2Error::Internal(format!(
                        "upstream returned {status} while listing tags"
                    )))
                }
            }
            let body: TagList = response.json().await?;
            if body.tags.is_empty() {
                break;
            }
            last = body.tags.last().cloned().unwrap_or_default();
            let page_len = body.tags.len();
            all_tags.extend(body.tags);
            if page_len < 1000 {
                break;
            }
        }
        Ok(all_tags)
    }
}

/// Parses the parameter list of a `WWW-Authenticate: Bearer ...` challenge.
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        params.insert(key.to_string(), value.trim_matches('"').to_string());
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.org/token",service="registry.example.org",scope="repository:foo:pull""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://auth.example.org/token");
        assert_eq!(params["service"], "registry.example.org");

        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
    }
}
