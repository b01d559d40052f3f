use std::fmt::{self, Display, Formatter};

use hyper::StatusCode;
use serde_json::json;
use tracing::debug;

/// User-facing errors in the format mandated by the OCI Distribution spec.
///
/// Each variant maps to one of the spec's error codes plus an HTTP status.
/// The detail strings carried by some variants end up in the `message`
/// field of the JSON error body.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryV2Error {
    BlobUnknown,
    BlobUploadInvalid(String),
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown(String),
    ManifestInvalid(String),
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    TagInvalid,
    Unauthorized(String),
    Denied(String),
    Unsupported,
    TooManyRequests,
    QuotaExceeded(String),
    // Keppel-specific retryable condition: another worker is replicating the
    // same blob right now. Clients must retry after a short delay.
    CurrentlyReplicating,
    Internal(String),
}

impl RegistryV2Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BlobUnknown => "BLOB_UNKNOWN",
            Self::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            Self::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            Self::DigestInvalid => "DIGEST_INVALID",
            Self::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            Self::ManifestInvalid(_) => "MANIFEST_INVALID",
            Self::ManifestUnknown => "MANIFEST_UNKNOWN",
            Self::NameInvalid => "NAME_INVALID",
            Self::NameUnknown => "NAME_UNKNOWN",
            Self::SizeInvalid => "SIZE_INVALID",
            Self::TagInvalid => "TAG_INVALID",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Denied(_) => "DENIED",
            Self::Unsupported => "UNSUPPORTED",
            Self::TooManyRequests => "TOOMANYREQUESTS",
            Self::QuotaExceeded(_) => "DENIED",
            Self::CurrentlyReplicating => "TOOMANYREQUESTS",
            Self::Internal(_) => "UNKNOWN",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BlobUnknown | Self::BlobUploadUnknown | Self::ManifestUnknown | Self::NameUnknown => {
                StatusCode::NOT_FOUND
            }
            Self::BlobUploadInvalid(_)
            | Self::DigestInvalid
            | Self::ManifestBlobUnknown(_)
            | Self::ManifestInvalid(_)
            | Self::NameInvalid
            | Self::SizeInvalid
            | Self::TagInvalid => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Denied(_) => StatusCode::FORBIDDEN,
            Self::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            Self::TooManyRequests | Self::CurrentlyReplicating => StatusCode::TOO_MANY_REQUESTS,
            Self::QuotaExceeded(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Renders the JSON error body per the OCI Distribution spec.
    pub fn to_json(&self) -> Vec<u8> {
        let body = json!({
            "errors": [{
                "code": self.code(),
                "message": self.to_string(),
                "detail": null,
            }]
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }
}

impl Display for RegistryV2Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlobUnknown => write!(f, "blob unknown to registry"),
            Self::BlobUploadInvalid(s) => write!(f, "blob upload invalid: {s}"),
            Self::BlobUploadUnknown => write!(f, "blob upload unknown to registry"),
            Self::DigestInvalid => write!(f, "provided digest did not match uploaded content"),
            Self::ManifestBlobUnknown(s) => write!(f, "manifest references a blob unknown to registry: {s}"),
            Self::ManifestInvalid(s) => write!(f, "manifest invalid: {s}"),
            Self::ManifestUnknown => write!(f, "manifest unknown to registry"),
            Self::NameInvalid => write!(f, "invalid repository name"),
            Self::NameUnknown => write!(f, "repository name not known to registry"),
            Self::SizeInvalid => write!(f, "provided length did not match content length"),
            Self::TagInvalid => write!(f, "manifest tag did not match URI"),
            Self::Unauthorized(s) => write!(f, "unauthorized: {s}"),
            Self::Denied(s) => write!(f, "requested access to the resource is denied: {s}"),
            Self::Unsupported => write!(f, "the operation is unsupported"),
            Self::TooManyRequests => write!(f, "too many requests"),
            Self::QuotaExceeded(s) => write!(f, "quota exceeded: {s}"),
            Self::CurrentlyReplicating => {
                write!(f, "currently replicating on behalf of another request, please retry")
            }
            Self::Internal(s) => write!(f, "internal server error: {s}"),
        }
    }
}

impl std::error::Error for RegistryV2Error {}

impl From<sqlx::Error> for RegistryV2Error {
    fn from(error: sqlx::Error) -> Self {
        debug!("database error: {error:?}");
        Self::Internal("database error during operation".into())
    }
}

impl From<std::io::Error> for RegistryV2Error {
    fn from(error: std::io::Error) -> Self {
        debug!("I/O error: {error:?}");
        Self::Internal("I/O error during operation".into())
    }
}

impl From<hyper::Error> for RegistryV2Error {
    fn from(error: hyper::Error) -> Self {
        debug!("hyper error: {error:?}");
        Self::Internal("HTTP error during operation".into())
    }
}

impl From<hyper::http::Error> for RegistryV2Error {
    fn from(error: hyper::http::Error) -> Self {
        debug!("hyper http error: {error:?}");
        Self::Internal("HTTP error during operation".into())
    }
}

impl From<serde_json::Error> for RegistryV2Error {
    fn from(error: serde_json::Error) -> Self {
        debug!("serde_json error: {error:?}");
        Self::Internal("(de)serialization error during operation".into())
    }
}

impl From<reqwest::Error> for RegistryV2Error {
    fn from(error: reqwest::Error) -> Self {
        debug!("outbound HTTP error: {error:?}");
        Self::Internal("error during outbound HTTP request".into())
    }
}
