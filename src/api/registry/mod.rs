//! Handlers for the OCI Distribution API, including the Keppel deviations:
//! catalog scoping, replication on pull, alternate manifest serving, anycast
//! forwarding.

pub mod blobs;
pub mod catalog;
pub mod manifests;
pub mod uploads;

use hyper::http::request::Parts;
use hyper::{Response, StatusCode};

use super::body::{self, Body};
use super::{Api, API_VERSION_HEADER_NAME, API_VERSION_HEADER_VALUE};
use crate::auth::{token::parse_token, Audience};
use crate::errors::RegistryV2Error;

/// `GET /v2/`: version check. Returns 200 for any valid token, 401 with an
/// auth challenge otherwise.
pub async fn handle_api_version(
    api: &Api,
    parts: &Parts,
    audience: &Audience,
) -> Result<Response<Body>, RegistryV2Error> {
    let token = parts
        .headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = match token {
        Some(token) => parse_token(&api.config, &api.ad, audience, token).is_ok(),
        None => false,
    };
    if !authorized {
        return Ok(api.challenge_response(audience, None, None));
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(API_VERSION_HEADER_NAME, API_VERSION_HEADER_VALUE)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::fixed("{}"))?)
}

/// The media types listed in the request's Accept header, with parameters
/// stripped. An empty list means the client did not express a preference.
pub(crate) fn accepted_media_types(parts: &Parts) -> Vec<String> {
    let mut result = Vec::new();
    for value in parts.headers.get_all(hyper::header::ACCEPT) {
        let Ok(value) = value.to_str() else { continue };
        for item in value.split(',') {
            let media_type = item.split(';').next().unwrap_or_default().trim();
            if !media_type.is_empty() {
                result.push(media_type.to_string());
            }
        }
    }
    result
}

pub(crate) fn accepts(accepted: &[String], media_type: &str) -> bool {
    accepted.is_empty() || accepted.iter().any(|a| a == media_type || a == "*/*")
}
