//! End-to-end scenarios driven through the public HTTP surface.

use serde_json::json;
use std::time::Duration;

use super::{Setup, TestClient, UpstreamStub};
use crate::db::{self, MARK_AND_SWEEP_GRACE_SECS};
use crate::drivers::StorageDriver as _;
use crate::oci::manifest::{MEDIA_TYPE_DOCKER_IMAGE, MEDIA_TYPE_DOCKER_LIST};
use crate::oci::Digest;

fn image_manifest(config_digest: &Digest, config_size: usize, layer_digest: &Digest, layer_size: usize) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_DOCKER_IMAGE,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": config_digest.to_string(),
            "size": config_size,
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "digest": layer_digest.to_string(),
            "size": layer_size,
        }],
    }))
    .unwrap()
}

/// Pushes a one-layer image and returns (config digest, layer digest,
/// manifest bytes, manifest digest).
async fn push_simple_image(
    client: &TestClient,
    token: &str,
    repo_path: &str,
    tag: &str,
    seed: &str,
) -> (Digest, Digest, Vec<u8>, Digest) {
    let config_contents = format!("{{\"architecture\":\"amd64\",\"os\":\"linux\",\"seed\":\"{seed}\"}}");
    let layer_contents = format!("layer bytes for {seed}");

    let config_digest = client.push_blob(token, repo_path, config_contents.as_bytes()).await;
    let layer_digest = client.push_blob(token, repo_path, layer_contents.as_bytes()).await;

    let manifest_bytes = image_manifest(
        &config_digest,
        config_contents.len(),
        &layer_digest,
        layer_contents.len(),
    );
    let manifest_digest = client
        .push_manifest(token, repo_path, tag, MEDIA_TYPE_DOCKER_IMAGE, &manifest_bytes)
        .await;
    (config_digest, layer_digest, manifest_bytes, manifest_digest)
}

async fn wait_until_blob_is_backed(setup: &Setup, account_name: &str, digest: &Digest) {
    for _ in 0..100 {
        let blob = db::find_blob(&setup.db, account_name, &digest.to_string())
            .await
            .unwrap();
        if blob.as_ref().is_some_and(|b| !b.is_unbacked()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("blob {digest} in account {account_name} never became backed");
}

#[tokio::test]
async fn test_primary_push_and_pull() {
    let mut setup = Setup::new("registry-a.example.org").await;
    let base_url = setup.serve().await;
    setup.create_primary_account("library").await;

    let client = TestClient::new(&base_url, "registry-a.example.org");
    let token = client.get_token(&["repository:library/alpine:pull,push"]).await;
    let (_, layer_digest, manifest_bytes, manifest_digest) =
        push_simple_image(&client, &token, "library/alpine", "3.9", "primary").await;

    // pull the manifest back by tag
    let response = client
        .request(reqwest::Method::GET, "/v2/library/alpine/manifests/3.9")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["Docker-Content-Digest"].to_str().unwrap(),
        manifest_digest.to_string()
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), manifest_bytes);

    // pull one of its blobs
    let response = client
        .request(reqwest::Method::GET, &format!("/v2/library/alpine/blobs/{layer_digest}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), b"layer bytes for primary");
}

#[tokio::test]
async fn test_replica_pull_on_first_use() {
    // the upstream holds one image; the replica starts out empty
    let stub = UpstreamStub::new();
    let config_contents = br#"{"architecture":"amd64","os":"linux"}"#;
    let layer_contents = b"upstream layer bytes";
    let config_digest = stub.add_blob(config_contents);
    let layer_digest = stub.add_blob(layer_contents);
    let manifest_bytes = image_manifest(&config_digest, config_contents.len(), &layer_digest, layer_contents.len());
    stub.add_manifest("alpine", "3.9", MEDIA_TYPE_DOCKER_IMAGE, &manifest_bytes);
    let stub_url = stub.serve().await;

    let mut setup = Setup::new("registry-b.example.org").await;
    let base_url = setup.serve().await;
    setup.create_external_replica_account("library", &stub_url).await;

    let client = TestClient::new(&base_url, "registry-b.example.org");
    let token = client.get_token(&["repository:library/alpine:pull"]).await;

    // first pull of the manifest replicates it
    let response = client
        .request(reqwest::Method::GET, "/v2/library/alpine/manifests/3.9")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), manifest_bytes);
    assert_eq!(stub.manifest_hits(), 1);

    // the referenced blobs now exist as unbacked rows
    let blob = db::find_blob(&setup.db, "library", &layer_digest.to_string())
        .await
        .unwrap()
        .expect("unbacked blob row is missing");
    assert!(blob.is_unbacked());

    // first pull of the blob streams from upstream and persists locally
    let response = client
        .request(reqwest::Method::GET, &format!("/v2/library/alpine/blobs/{layer_digest}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["Docker-Content-Digest"].to_str().unwrap(),
        layer_digest.to_string()
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), layer_contents);
    wait_until_blob_is_backed(&setup, "library", &layer_digest).await;
    assert_eq!(stub.blob_hits(), 1);

    // the second pull is answered from the local copy
    let response = client
        .request(reqwest::Method::GET, &format!("/v2/library/alpine/blobs/{layer_digest}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), layer_contents);
    assert_eq!(stub.blob_hits(), 1, "second pull must not reach the upstream");
}

#[tokio::test]
async fn test_concurrent_replica_pulls_of_same_blob() {
    let stub = UpstreamStub::new();
    let config_contents = br#"{"architecture":"amd64","os":"linux"}"#;
    let layer_contents = b"slowly transferred layer";
    let config_digest = stub.add_blob(config_contents);
    let layer_digest = stub.add_blob(layer_contents);
    let manifest_bytes = image_manifest(&config_digest, config_contents.len(), &layer_digest, layer_contents.len());
    stub.add_manifest("alpine", "3.9", MEDIA_TYPE_DOCKER_IMAGE, &manifest_bytes);
    stub.set_blob_delay(Duration::from_millis(300));
    let stub_url = stub.serve().await;

    let mut setup = Setup::new("registry-b.example.org").await;
    let base_url = setup.serve().await;
    setup.create_external_replica_account("library", &stub_url).await;

    let client = TestClient::new(&base_url, "registry-b.example.org");
    let token = client.get_token(&["repository:library/alpine:pull"]).await;
    client
        .request(reqwest::Method::GET, "/v2/library/alpine/manifests/3.9")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    // two pullers race for the same absent blob
    let blob_path = format!("/v2/library/alpine/blobs/{layer_digest}");
    let first = client.request(reqwest::Method::GET, &blob_path).bearer_auth(&token).send();
    let second = async {
        // let the first request take the pending-blob marker
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.request(reqwest::Method::GET, &blob_path).bearer_auth(&token).send().await
    };
    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 429, "the racing puller must be told to retry");
    assert_eq!(first.bytes().await.unwrap().to_vec(), layer_contents);

    // after the replication finishes, the retry is served locally
    wait_until_blob_is_backed(&setup, "library", &layer_digest).await;
    let retry = client
        .request(reqwest::Method::GET, &blob_path)
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), 200);
    assert_eq!(retry.bytes().await.unwrap().to_vec(), layer_contents);
    assert_eq!(stub.blob_hits(), 1);
}

#[tokio::test]
async fn test_mark_and_sweep_after_manifest_deletion() {
    let mut setup = Setup::new("registry-a.example.org").await;
    let base_url = setup.serve().await;
    setup.create_primary_account("library").await;

    let client = TestClient::new(&base_url, "registry-a.example.org");
    let token = client
        .get_token(&["repository:library/alpine:pull,push,delete"])
        .await;
    let (_config_digest, _layer_digest, _, manifest_digest) =
        push_simple_image(&client, &token, "library/alpine", "3.9", "sweepme").await;

    // deleting the manifest unlinks the tag as well
    let response = client
        .request(
            reqwest::Method::DELETE,
            &format!("/v2/library/alpine/manifests/{manifest_digest}"),
        )
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let count_rows = |query: &'static str| {
        let db = setup.db.clone();
        async move {
            let (count,): (i64,) = sqlx::query_as(query).fetch_one(&db).await.unwrap();
            count
        }
    };

    // first mount-sweep pass only marks
    setup.janitor.sweep_blob_mounts_next().await.unwrap();
    assert_eq!(count_rows("SELECT COUNT(*) FROM blob_mounts").await, 2);
    assert_eq!(
        count_rows("SELECT COUNT(*) FROM blob_mounts WHERE can_be_deleted_at IS NOT NULL").await,
        2
    );

    // the next pass after the grace period sweeps
    setup.advance_clock(MARK_AND_SWEEP_GRACE_SECS + 3600);
    setup.janitor.sweep_blob_mounts_next().await.unwrap();
    assert_eq!(count_rows("SELECT COUNT(*) FROM blob_mounts").await, 0);

    // same two-pass pattern for the blobs themselves
    setup.janitor.sweep_blobs_next().await.unwrap();
    assert_eq!(count_rows("SELECT COUNT(*) FROM blobs").await, 2);
    setup.advance_clock(MARK_AND_SWEEP_GRACE_SECS + 3600);
    setup.janitor.sweep_blobs_next().await.unwrap();
    assert_eq!(count_rows("SELECT COUNT(*) FROM blobs").await, 0);

    // the sweeps also removed the storage objects, so the storage sweep has
    // nothing left to reclaim
    setup.janitor.sweep_storage_next().await.unwrap();
    assert_eq!(count_rows("SELECT COUNT(*) FROM unknown_blobs").await, 0);
    assert_eq!(count_rows("SELECT COUNT(*) FROM unknown_manifests").await, 0);
    let contents = setup.memory_storage.list_storage_contents("library").await.unwrap();
    assert!(contents.blobs.is_empty());
    assert!(contents.manifests.is_empty());
}

#[tokio::test]
async fn test_multiarch_alternate_serving() {
    let mut setup = Setup::new("registry-a.example.org").await;
    let base_url = setup.serve().await;
    setup.create_primary_account("library").await;

    let client = TestClient::new(&base_url, "registry-a.example.org");
    let token = client.get_token(&["repository:library/multi:pull,push"]).await;

    let (_, _, amd64_bytes, amd64_digest) =
        push_simple_image(&client, &token, "library/multi", "amd64", "amd64").await;
    let (_, _, _, arm_digest) = push_simple_image(&client, &token, "library/multi", "arm", "arm").await;

    let list_bytes = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_DOCKER_LIST,
        "manifests": [
            {
                "mediaType": MEDIA_TYPE_DOCKER_IMAGE,
                "digest": amd64_digest.to_string(),
                "size": amd64_bytes.len(),
                "platform": {"os": "linux", "architecture": "amd64"},
            },
            {
                "mediaType": MEDIA_TYPE_DOCKER_IMAGE,
                "digest": arm_digest.to_string(),
                "size": 42,
                "platform": {"os": "linux", "architecture": "arm"},
            },
        ],
    }))
    .unwrap();
    client
        .push_manifest(&token, "library/multi", "latest", MEDIA_TYPE_DOCKER_LIST, &list_bytes)
        .await;

    // a client that only accepts Docker v2 schema 2 gets the linux/amd64
    // child instead of the list
    let response = client
        .request(reqwest::Method::GET, "/v2/library/multi/manifests/latest")
        .bearer_auth(&token)
        .header(reqwest::header::ACCEPT, MEDIA_TYPE_DOCKER_IMAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["Docker-Content-Digest"].to_str().unwrap(),
        amd64_digest.to_string()
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), amd64_bytes);

    // a list-aware client still gets the list
    let response = client
        .request(reqwest::Method::GET, "/v2/library/multi/manifests/latest")
        .bearer_auth(&token)
        .header(
            reqwest::header::ACCEPT,
            format!("{MEDIA_TYPE_DOCKER_LIST}, {MEDIA_TYPE_DOCKER_IMAGE}"),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap().to_vec(), list_bytes);
}

#[tokio::test]
async fn test_account_deletion_progress() {
    let mut setup = Setup::new("registry-a.example.org").await;
    let base_url = setup.serve().await;
    setup.create_primary_account("library").await;

    let client = TestClient::new(&base_url, "registry-a.example.org");
    let token = client.get_token(&["repository:library/multi:pull,push"]).await;
    let (_, _, amd64_bytes, amd64_digest) =
        push_simple_image(&client, &token, "library/multi", "amd64", "del-amd64").await;
    let (_, _, _, arm_digest) = push_simple_image(&client, &token, "library/multi", "arm", "del-arm").await;
    let list_bytes = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_DOCKER_LIST,
        "manifests": [
            {"mediaType": MEDIA_TYPE_DOCKER_IMAGE, "digest": amd64_digest.to_string(), "size": amd64_bytes.len(),
             "platform": {"os": "linux", "architecture": "amd64"}},
            {"mediaType": MEDIA_TYPE_DOCKER_IMAGE, "digest": arm_digest.to_string(), "size": 42,
             "platform": {"os": "linux", "architecture": "arm"}},
        ],
    }))
    .unwrap();
    client
        .push_manifest(&token, "library/multi", "latest", MEDIA_TYPE_DOCKER_LIST, &list_bytes)
        .await;

    setup.processor.mark_account_for_deletion("library").await.unwrap();
    setup.advance_clock(1);

    // first attempt: deletes the list, then its children, then the repos,
    // and arms the blob sweep
    setup.janitor.delete_next_marked_account().await.unwrap();
    let (manifest_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM manifests")
        .fetch_one(&setup.db)
        .await
        .unwrap();
    assert_eq!(manifest_count, 0);
    let (repo_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM repos")
        .fetch_one(&setup.db)
        .await
        .unwrap();
    assert_eq!(repo_count, 0);
    assert!(db::find_account(&setup.db, "library").await.unwrap().is_some());

    // the blob sweep reclaims the now-unmounted blobs
    setup.advance_clock(1);
    setup.janitor.sweep_blobs_next().await.unwrap();
    let (blob_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs")
        .fetch_one(&setup.db)
        .await
        .unwrap();
    assert_eq!(blob_count, 0);

    // the next attempt removes the account row, the storage namespace and
    // the federation claim
    setup.advance_clock(120);
    setup.janitor.delete_next_marked_account().await.unwrap();
    assert!(db::find_account(&setup.db, "library").await.unwrap().is_none());
    assert!(setup.fd.find_primary_account("library").await.unwrap().is_none());
    let contents = setup.memory_storage.list_storage_contents("library").await.unwrap();
    assert!(contents.blobs.is_empty() && contents.manifests.is_empty());
}

#[tokio::test]
async fn test_anycast_forwarding_loop_protection() {
    let mut setup = Setup::new("registry-b.example.org").await;
    let base_url = setup.serve().await;

    // the federation state (erroneously) says that some other peer hosts the
    // primary for this account
    let ghost = db::Account {
        name: "ghost".into(),
        auth_tenant_id: "tenant1".into(),
        upstream_peer_hostname: "registry-a.example.org".into(),
        external_peer_url: String::new(),
        external_peer_username: String::new(),
        external_peer_password: String::new(),
        platform_filter: String::new(),
        gc_policies_json: "[]".into(),
        rbac_policies_json: "[]".into(),
        tag_policies_json: "[]".into(),
        validation_policy_json: String::new(),
        security_scan_policies_json: "[]".into(),
        is_deleting: false,
        is_managed: false,
        next_blob_sweep_at: None,
        next_storage_sweep_at: None,
        next_federation_announcement_at: None,
        next_deletion_attempt_at: None,
    };
    setup.fd.record_existing_account(&ghost, 0).await.unwrap();

    // mint an anycast token covering the account, as the primary would have
    let identity = setup.ad.authenticate_user("johndoe", "SuperSecret").await.unwrap();
    let mut scope_set = crate::auth::ScopeSet::default();
    scope_set.add(crate::auth::Scope::repository("ghost/img", &["pull"]));
    let authorization = crate::auth::Authorization {
        user_identity: identity,
        scope_set,
        audience: crate::auth::Audience { is_anycast: true, account_name: String::new() },
    };
    let token = authorization.issue_token(&setup.config).unwrap().token;

    let client = TestClient::new(&base_url, "anycast.registry-b.example.org");

    // a request that was already forwarded once is refused instead of being
    // forwarded again
    let response = client
        .request(reqwest::Method::GET, "/v2/ghost/img/manifests/latest")
        .bearer_auth(&token)
        .header("X-Keppel-Forwarded-By", "registry-a.example.org")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404, "a forwarded request must not be forwarded again");

    // without the forwarding marker, the instance does try to reach the
    // (unreachable) primary instead of answering 404 itself
    let response = client
        .request(reqwest::Method::GET, "/v2/ghost/img/manifests/latest")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_ne!(response.status(), 404);
}

#[tokio::test]
async fn test_catalog_pagination() {
    let mut setup = Setup::new("registry-a.example.org").await;
    let base_url = setup.serve().await;
    setup.create_primary_account("library").await;

    let client = TestClient::new(&base_url, "registry-a.example.org");
    let token = client
        .get_token(&[
            "repository:library/alpine:push,pull",
            "repository:library/nginx:push,pull",
            "registry:catalog:*",
        ])
        .await;
    push_simple_image(&client, &token, "library/alpine", "latest", "cat-1").await;
    push_simple_image(&client, &token, "library/nginx", "latest", "cat-2").await;

    let response = client
        .request(reqwest::Method::GET, "/v2/_catalog")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["repositories"], json!(["library/alpine", "library/nginx"]));

    // n=1 with a marker returns a single name strictly greater than it
    let response = client
        .request(reqwest::Method::GET, "/v2/_catalog?n=1&last=library/alpine")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["repositories"], json!(["library/nginx"]));
}

#[tokio::test]
async fn test_chunked_upload_session() {
    let mut setup = Setup::new("registry-a.example.org").await;
    let base_url = setup.serve().await;
    setup.create_primary_account("library").await;

    let client = TestClient::new(&base_url, "registry-a.example.org");
    let token = client.get_token(&["repository:library/alpine:pull,push"]).await;

    let response = client
        .request(reqwest::Method::POST, "/v2/library/alpine/blobs/uploads/")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let location = response.headers()["Location"].to_str().unwrap().to_string();

    // two chunks, then a digest-carrying finalize
    let chunk1 = b"hello ";
    let chunk2 = b"chunked world";
    let full: Vec<u8> = [chunk1.as_slice(), chunk2.as_slice()].concat();
    let digest = Digest::of_bytes(&full);

    for chunk in [chunk1.as_slice(), chunk2.as_slice()] {
        let response = client
            .request(reqwest::Method::PATCH, &location)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_LENGTH, chunk.len())
            .body(chunk.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
    }

    let response = client
        .request(reqwest::Method::PUT, &format!("{location}?digest={digest}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // the finished blob has the declared size and content
    let blob = db::find_blob(&setup.db, "library", &digest.to_string())
        .await
        .unwrap()
        .expect("blob row is missing after upload");
    assert_eq!(blob.size_bytes as usize, full.len());

    let response = client
        .request(reqwest::Method::GET, &format!("/v2/library/alpine/blobs/{digest}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap().to_vec(), full);
}

#[tokio::test]
async fn test_manifest_quota() {
    let mut setup = Setup::new("registry-a.example.org").await;
    let base_url = setup.serve().await;
    setup.create_primary_account("library").await;

    sqlx::query("INSERT INTO quotas (auth_tenant_id, max_manifests) VALUES ('tenant1', 1)")
        .execute(&setup.db)
        .await
        .unwrap();

    let client = TestClient::new(&base_url, "registry-a.example.org");
    let token = client.get_token(&["repository:library/alpine:pull,push"]).await;
    push_simple_image(&client, &token, "library/alpine", "one", "quota-1").await;

    // the second manifest exceeds the quota
    let config_contents = br#"{"os":"linux","note":"quota-2"}"#;
    let layer_contents = b"second layer";
    let config_digest = client.push_blob(&token, "library/alpine", config_contents).await;
    let layer_digest = client.push_blob(&token, "library/alpine", layer_contents).await;
    let manifest_bytes = image_manifest(&config_digest, config_contents.len(), &layer_digest, layer_contents.len());
    let response = client
        .request(reqwest::Method::PUT, "/v2/library/alpine/manifests/two")
        .bearer_auth(&token)
        .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE_DOCKER_IMAGE)
        .body(manifest_bytes)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_manifest_sync_drops_tags_deleted_upstream() {
    let stub = UpstreamStub::new();
    let config_contents = br#"{"architecture":"amd64","os":"linux"}"#;
    let layer_contents = b"sync layer";
    let config_digest = stub.add_blob(config_contents);
    let layer_digest = stub.add_blob(layer_contents);
    let manifest_bytes = image_manifest(&config_digest, config_contents.len(), &layer_digest, layer_contents.len());
    stub.add_manifest("alpine", "3.9", MEDIA_TYPE_DOCKER_IMAGE, &manifest_bytes);
    let stub_url = stub.serve().await;

    let mut setup = Setup::new("registry-b.example.org").await;
    let base_url = setup.serve().await;
    setup.create_external_replica_account("library", &stub_url).await;

    let client = TestClient::new(&base_url, "registry-b.example.org");
    let token = client.get_token(&["repository:library/alpine:pull"]).await;
    client
        .request(reqwest::Method::GET, "/v2/library/alpine/manifests/3.9")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    // upstream deletes the image; the next sync mirrors that
    stub.remove_manifest("alpine", "3.9");
    setup.janitor.sync_next_replica_repo().await.unwrap();

    let repo = db::find_repo(&setup.db, "library", "alpine").await.unwrap().unwrap();
    assert!(db::find_tag(&setup.db, repo.id, "3.9").await.unwrap().is_none());
    let (manifest_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM manifests WHERE repo_id = $1")
        .bind(repo.id)
        .fetch_one(&setup.db)
        .await
        .unwrap();
    assert_eq!(manifest_count, 0);
}
