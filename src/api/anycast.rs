//! Anycast request forwarding. An API instance that receives an anycast
//! request for an account it does not host reverse-proxies the request to
//! the peer holding the primary account. A forwarded request is marked so
//! that it can never be forwarded a second time, which breaks forwarding
//! loops between peers with inconsistent views.

use futures_util::TryStreamExt as _;
use hyper::header::{ACCEPT, AUTHORIZATION};
use hyper::http::request::Parts;
use hyper::Response;
use tracing::debug;

use super::body::{self, Body};
use crate::auth::Audience;
use crate::configuration::Configuration;
use crate::errors::RegistryV2Error;

pub const FORWARDED_BY_HEADER: &str = "X-Keppel-Forwarded-By";

/// Whether this request was already forwarded by another peer and therefore
/// must not be forwarded again.
pub fn was_forwarded(parts: &Parts) -> bool {
    parts.headers.contains_key(FORWARDED_BY_HEADER)
}

/// Reverse-proxies the request to the given peer, preserving method, path,
/// Accept and Authorization headers. Redirects from the upstream are passed
/// through to the client verbatim rather than followed.
pub async fn reverse_proxy_to_peer(
    config: &Configuration,
    audience: &Audience,
    parts: &Parts,
    peer_hostname: &str,
) -> Result<Response<Body>, RegistryV2Error> {
    let target_host = audience.map_peer_hostname(peer_hostname);
    let path = parts.uri.path();

    // make the forwarding visible in the other keppel's log file
    let mut query = format!("forwarded-by={}", config.api_public_hostname);
    if let Some(original_query) = parts.uri.query() {
        query = format!("{original_query}&{query}");
    }
    let url = format!("https://{target_host}{path}?{query}");
    debug!("forwarding anycast request to {url}");

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let mut request = client.request(
        reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|_| RegistryV2Error::Unsupported)?,
        &url,
    );
    for header_name in [ACCEPT, AUTHORIZATION] {
        for value in parts.headers.get_all(&header_name) {
            if let Ok(value) = value.to_str() {
                request = request.header(header_name.clone(), value);
            }
        }
    }
    request = request.header(FORWARDED_BY_HEADER, &config.api_public_hostname);

    let upstream_response = request.send().await?;

    let mut builder = Response::builder().status(upstream_response.status().as_u16());
    for (name, value) in upstream_response.headers() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let stream = upstream_response
        .bytes_stream()
        .map_err(|err| std::io::Error::other(err.to_string()));
    let reader = tokio_util::io::StreamReader::new(stream);
    Ok(builder.body(body::from_reader(reader))?)
}
