//! A tiny unauthenticated registry used as the upstream of external replica
//! accounts in tests. It serves fixed manifests and blobs and counts hits, so
//! tests can assert that later pulls are answered from the local copy.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use crate::api::body::{self, Body};
use crate::oci::Digest;

#[derive(Default)]
struct StubState {
    /// (repo, reference) -> (media type, contents)
    manifests: Mutex<HashMap<(String, String), (String, Vec<u8>)>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    blob_hits: AtomicU64,
    manifest_hits: AtomicU64,
    blob_delay: Mutex<Option<Duration>>,
}

#[derive(Clone)]
pub struct UpstreamStub {
    state: Arc<StubState>,
}

impl UpstreamStub {
    pub fn new() -> Self {
        UpstreamStub { state: Arc::new(StubState::default()) }
    }

    pub fn add_manifest(&self, repo: &str, reference: &str, media_type: &str, contents: &[u8]) {
        let digest = Digest::of_bytes(contents);
        let mut manifests = self.state.manifests.lock().unwrap();
        manifests.insert(
            (repo.to_string(), reference.to_string()),
            (media_type.to_string(), contents.to_vec()),
        );
        // manifests are also addressable by digest
        manifests.insert(
            (repo.to_string(), digest.to_string()),
            (media_type.to_string(), contents.to_vec()),
        );
    }

    pub fn remove_manifest(&self, repo: &str, reference: &str) {
        let mut manifests = self.state.manifests.lock().unwrap();
        if let Some((_, contents)) = manifests.remove(&(repo.to_string(), reference.to_string())) {
            let digest = Digest::of_bytes(&contents);
            manifests.remove(&(repo.to_string(), digest.to_string()));
        }
    }

    pub fn add_blob(&self, contents: &[u8]) -> Digest {
        let digest = Digest::of_bytes(contents);
        self.state.blobs.lock().unwrap().insert(digest.to_string(), contents.to_vec());
        digest
    }

    /// Delays blob responses; used to hold a replication open while a second
    /// puller races it.
    pub fn set_blob_delay(&self, delay: Duration) {
        *self.state.blob_delay.lock().unwrap() = Some(delay);
    }

    pub fn blob_hits(&self) -> u64 {
        self.state.blob_hits.load(Ordering::SeqCst)
    }

    pub fn manifest_hits(&self) -> u64 {
        self.state.manifest_hits.load(Ordering::SeqCst)
    }

    /// Serves the stub on a loopback listener, returning its base URL.
    pub async fn serve(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("cannot bind stub listener");
        let address: SocketAddr = listener.local_addr().unwrap();
        let state = self.state.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(&state, request).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        format!("http://{address}")
    }
}

async fn handle(state: &StubState, request: hyper::Request<hyper::body::Incoming>) -> hyper::Response<Body> {
    let path = request.uri().path().to_string();
    let is_head = request.method() == hyper::Method::HEAD;

    let not_found = || {
        hyper::Response::builder()
            .status(404)
            .body(body::empty())
            .unwrap()
    };

    let Some(path) = path.strip_prefix("/v2/") else {
        return not_found();
    };

    if let Some(position) = path.rfind("/manifests/") {
        let repo = &path[..position];
        let reference = &path[position + "/manifests/".len()..];
        let manifest = state
            .manifests
            .lock()
            .unwrap()
            .get(&(repo.to_string(), reference.to_string()))
            .cloned();
        let Some((media_type, contents)) = manifest else {
            return not_found();
        };
        state.manifest_hits.fetch_add(1, Ordering::SeqCst);
        let digest = Digest::of_bytes(&contents);
        let builder = hyper::Response::builder()
            .status(200)
            .header("Content-Type", media_type)
            .header("Content-Length", contents.len())
            .header("Docker-Content-Digest", digest.to_string());
        return if is_head {
            builder.body(body::empty()).unwrap()
        } else {
            builder.body(body::fixed(contents)).unwrap()
        };
    }

    if let Some(position) = path.rfind("/blobs/") {
        let digest = &path[position + "/blobs/".len()..];
        let blob = state.blobs.lock().unwrap().get(digest).cloned();
        let Some(contents) = blob else {
            return not_found();
        };
        let delay = *state.blob_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        state.blob_hits.fetch_add(1, Ordering::SeqCst);
        return hyper::Response::builder()
            .status(200)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", contents.len())
            .header("Docker-Content-Digest", digest)
            .body(body::fixed(contents))
            .unwrap();
    }

    if let Some(repo) = path.strip_suffix("/tags/list") {
        let tags: Vec<String> = state
            .manifests
            .lock()
            .unwrap()
            .keys()
            .filter(|(tag_repo, reference)| tag_repo == repo && !reference.starts_with("sha256:"))
            .map(|(_, reference)| reference.clone())
            .collect();
        let mut tags = tags;
        tags.sort();
        let payload = json!({ "name": repo, "tags": tags });
        return hyper::Response::builder()
            .status(200)
            .header("Content-Type", "application/json")
            .body(body::fixed(serde_json::to_vec(&payload).unwrap()))
            .unwrap();
    }

    not_found()
}
