//! URL routing for both API surfaces. Repository names are kept as raw path
//! segments here; account resolution (including domain remapping) happens in
//! the handlers, which know the request's audience.

use hyper::{Method, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;

use crate::oci::{Digest, Reference};

#[derive(Debug)]
pub enum Route<'a> {
    Healthz,
    Metrics,
    ApiVersion,
    Catalog { n: Option<u64>, last: Option<String> },
    ListTags { name: &'a str, n: Option<u64>, last: Option<String> },
    HeadManifest { name: &'a str, reference: Reference },
    GetManifest { name: &'a str, reference: Reference },
    PutManifest { name: &'a str, reference: Reference },
    DeleteManifest { name: &'a str, reference: Reference },
    HeadBlob { name: &'a str, digest: Digest },
    GetBlob { name: &'a str, digest: Digest },
    DeleteBlob { name: &'a str, digest: Digest },
    StartUpload {
        name: &'a str,
        digest: Option<Digest>,
        mount: Option<Digest>,
        from: Option<String>,
    },
    GetUpload { name: &'a str, uuid: String },
    PatchUpload { name: &'a str, uuid: String },
    PutUpload { name: &'a str, uuid: String, digest: Digest },
    DeleteUpload { name: &'a str, uuid: String },
    AuthToken,
    Peering,
    GetAccount { name: &'a str },
    PutAccount { name: &'a str },
    DeleteAccount { name: &'a str },
    PostSublease { name: &'a str },
    GetQuota { tenant: &'a str },
    PutQuota { tenant: &'a str },
    Unknown,
}

fn parse_query<T: DeserializeOwned + Default>(params: Option<&str>) -> T {
    params
        .and_then(|p| serde_urlencoded::from_str(p).ok())
        .unwrap_or_default()
}

#[derive(Deserialize, Default)]
struct PaginationQuery {
    n: Option<u64>,
    last: Option<String>,
}

#[derive(Deserialize, Default)]
struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

pub fn parse<'a>(method: &Method, uri: &'a Uri) -> Route<'a> {
    let path = uri.path();
    let params = uri.query();

    match (method, path) {
        (&Method::GET, "/healthz") => return Route::Healthz,
        (&Method::GET, "/metrics") => return Route::Metrics,
        (&Method::GET, "/v2" | "/v2/") => return Route::ApiVersion,
        (&Method::GET, "/v2/_catalog") => {
            let p: PaginationQuery = parse_query(params);
            return Route::Catalog { n: p.n, last: p.last };
        }
        (&Method::GET, "/keppel/v1/auth") => return Route::AuthToken,
        (&Method::POST, "/keppel/v1/auth/peering") => return Route::Peering,
        _ => {}
    }

    if let Some(rest) = path.strip_prefix("/keppel/v1/accounts/") {
        if let Some(name) = rest.strip_suffix("/sublease") {
            if method == Method::POST {
                return Route::PostSublease { name };
            }
        } else if !rest.is_empty() && !rest.contains('/') {
            match *method {
                Method::GET => return Route::GetAccount { name: rest },
                Method::PUT => return Route::PutAccount { name: rest },
                Method::DELETE => return Route::DeleteAccount { name: rest },
                _ => {}
            }
        }
        return Route::Unknown;
    }

    if let Some(tenant) = path.strip_prefix("/keppel/v1/quotas/") {
        if !tenant.is_empty() && !tenant.contains('/') {
            match *method {
                Method::GET => return Route::GetQuota { tenant },
                Method::PUT => return Route::PutQuota { tenant },
                _ => {}
            }
        }
        return Route::Unknown;
    }

    let Some(path) = path.strip_prefix("/v2/") else {
        return Route::Unknown;
    };

    if let Some(route) = try_parse_uploads(method, path, params) {
        return route;
    }
    if let Some(route) = try_parse_upload(method, path, params) {
        return route;
    }
    if let Some(route) = try_find_blobs(method, path) {
        return route;
    }
    if let Some(route) = try_find_manifests(method, path) {
        return route;
    }
    if let Some(route) = try_find_tags(method, path, params) {
        return route;
    }

    Route::Unknown
}

fn try_parse_uploads<'a>(method: &Method, path: &'a str, params: Option<&'a str>) -> Option<Route<'a>> {
    for suffix in ["/blobs/uploads", "/blobs/uploads/"] {
        if let Some(name) = path.strip_suffix(suffix) {
            if method == Method::POST {
                let q: UploadQuery = parse_query(params);
                return Some(Route::StartUpload {
                    name,
                    digest: q.digest.as_deref().and_then(|d| d.parse().ok()),
                    mount: q.mount.as_deref().and_then(|d| d.parse().ok()),
                    from: q.from,
                });
            }
        }
    }
    None
}

fn try_parse_upload<'a>(method: &Method, path: &'a str, params: Option<&'a str>) -> Option<Route<'a>> {
    let upload_position = path.rfind("/blobs/uploads/")?;
    let name = &path[..upload_position];
    let uuid = &path[upload_position + "/blobs/uploads/".len()..];
    let uuid = uuid::Uuid::from_str(uuid).ok()?.to_string();

    match *method {
        Method::GET => Some(Route::GetUpload { name, uuid }),
        Method::PATCH => Some(Route::PatchUpload { name, uuid }),
        Method::PUT => {
            let q: UploadQuery = parse_query(params);
            let digest = q.digest.as_deref()?.parse().ok()?;
            Some(Route::PutUpload { name, uuid, digest })
        }
        Method::DELETE => Some(Route::DeleteUpload { name, uuid }),
        _ => None,
    }
}

fn try_find_blobs<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let blob_position = path.rfind("/blobs/")?;
    let name = &path[..blob_position];
    let digest = Digest::from_str(&path[blob_position + "/blobs/".len()..]).ok()?;

    match *method {
        Method::GET => Some(Route::GetBlob { name, digest }),
        Method::HEAD => Some(Route::HeadBlob { name, digest }),
        Method::DELETE => Some(Route::DeleteBlob { name, digest }),
        _ => None,
    }
}

fn try_find_manifests<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let manifest_position = path.rfind("/manifests/")?;
    let name = &path[..manifest_position];
    let reference = Reference::from_str(&path[manifest_position + "/manifests/".len()..]).ok()?;

    match *method {
        Method::GET => Some(Route::GetManifest { name, reference }),
        Method::HEAD => Some(Route::HeadManifest { name, reference }),
        Method::PUT => Some(Route::PutManifest { name, reference }),
        Method::DELETE => Some(Route::DeleteManifest { name, reference }),
        _ => None,
    }
}

fn try_find_tags<'a>(method: &Method, path: &'a str, params: Option<&'a str>) -> Option<Route<'a>> {
    let name = path.strip_suffix("/tags/list")?;
    if method != Method::GET {
        return None;
    }
    let p: PaginationQuery = parse_query(params);
    Some(Route::ListTags { name, n: p.n, last: p.last })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_api_version() {
        for path in ["/v2", "/v2/"] {
            let uri: Uri = path.parse().unwrap();
            assert!(matches!(parse(&Method::GET, &uri), Route::ApiVersion));
        }
    }

    #[test]
    fn test_parse_catalog_with_pagination() {
        let uri: Uri = "/v2/_catalog?n=10&last=library/alpine".parse().unwrap();
        let Route::Catalog { n, last } = parse(&Method::GET, &uri) else {
            panic!("expected Catalog route");
        };
        assert_eq!(n, Some(10));
        assert_eq!(last.as_deref(), Some("library/alpine"));
    }

    #[test]
    fn test_parse_manifest_routes() {
        let uri: Uri = "/v2/library/alpine/manifests/3.9".parse().unwrap();
        let Route::GetManifest { name, reference } = parse(&Method::GET, &uri) else {
            panic!("expected GetManifest route");
        };
        assert_eq!(name, "library/alpine");
        assert_eq!(reference.to_string(), "3.9");

        let uri: Uri = format!("/v2/library/alpine/manifests/{DIGEST}").parse().unwrap();
        assert!(matches!(parse(&Method::DELETE, &uri), Route::DeleteManifest { .. }));
    }

    #[test]
    fn test_parse_blob_route_rejects_bad_digest() {
        let uri: Uri = "/v2/library/alpine/blobs/not-a-digest".parse().unwrap();
        assert!(matches!(parse(&Method::GET, &uri), Route::Unknown));
    }

    #[test]
    fn test_parse_upload_routes() {
        let uri: Uri = "/v2/library/alpine/blobs/uploads/".parse().unwrap();
        let Route::StartUpload { name, digest, mount, .. } = parse(&Method::POST, &uri) else {
            panic!("expected StartUpload route");
        };
        assert_eq!(name, "library/alpine");
        assert!(digest.is_none());
        assert!(mount.is_none());

        let uri: Uri = format!("/v2/library/alpine/blobs/uploads/?digest={DIGEST}").parse().unwrap();
        let Route::StartUpload { digest, .. } = parse(&Method::POST, &uri) else {
            panic!("expected StartUpload route");
        };
        assert_eq!(digest.unwrap().to_string(), DIGEST);

        let uuid = uuid::Uuid::new_v4();
        let uri: Uri = format!("/v2/library/alpine/blobs/uploads/{uuid}?digest={DIGEST}").parse().unwrap();
        assert!(matches!(parse(&Method::PUT, &uri), Route::PutUpload { .. }));
        // PUT without digest is not a valid finalize
        let uri: Uri = format!("/v2/library/alpine/blobs/uploads/{uuid}").parse().unwrap();
        assert!(matches!(parse(&Method::PUT, &uri), Route::Unknown));
    }

    #[test]
    fn test_parse_cross_repo_mount() {
        let uri: Uri = format!("/v2/library/alpine/blobs/uploads/?mount={DIGEST}&from=library/other")
            .parse()
            .unwrap();
        let Route::StartUpload { mount, from, .. } = parse(&Method::POST, &uri) else {
            panic!("expected StartUpload route");
        };
        assert_eq!(mount.unwrap().to_string(), DIGEST);
        assert_eq!(from.as_deref(), Some("library/other"));
    }

    #[test]
    fn test_parse_keppel_api_routes() {
        let uri: Uri = "/keppel/v1/auth?service=registry.example.org".parse().unwrap();
        assert!(matches!(parse(&Method::GET, &uri), Route::AuthToken));

        let uri: Uri = "/keppel/v1/accounts/library".parse().unwrap();
        assert!(matches!(parse(&Method::PUT, &uri), Route::PutAccount { name: "library" }));

        let uri: Uri = "/keppel/v1/accounts/library/sublease".parse().unwrap();
        assert!(matches!(parse(&Method::POST, &uri), Route::PostSublease { name: "library" }));

        let uri: Uri = "/keppel/v1/quotas/tenant1".parse().unwrap();
        assert!(matches!(parse(&Method::GET, &uri), Route::GetQuota { tenant: "tenant1" }));
    }

    #[test]
    fn test_parse_nested_repository_name() {
        let uri: Uri = "/v2/library/team/project/manifests/latest".parse().unwrap();
        let Route::GetManifest { name, .. } = parse(&Method::GET, &uri) else {
            panic!("expected GetManifest route");
        };
        assert_eq!(name, "library/team/project");
    }

    #[test]
    fn test_unknown_routes() {
        let uri: Uri = "/unrelated".parse().unwrap();
        assert!(matches!(parse(&Method::GET, &uri), Route::Unknown));
        let uri: Uri = "/v2/library/alpine/blobs/uploads/not-a-uuid".parse().unwrap();
        assert!(matches!(parse(&Method::GET, &uri), Route::Unknown));
    }
}
