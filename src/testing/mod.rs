//! Test harness: assembles a complete in-memory deployment (SQLite in
//! memory, in-memory storage, static auth, trivial federation) and serves
//! its HTTP surface on a loopback listener, so tests can drive the public
//! API with a real client.

pub mod scenarios;
mod upstream_stub;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::api::Api;
use crate::auth::keys::tests::generate_ed25519_pem;
use crate::auth::keys::IssuerKey;
use crate::configuration::{Configuration, StaticUser};
use crate::db::{self, DbPool};
use crate::drivers::federation::TrivialFederationDriver;
use crate::drivers::ratelimit::NoopRateLimitDriver;
use crate::drivers::storage::memory::InMemoryDriver;
use crate::drivers::{AuthDriver, FederationDriver, StorageDriver};
use crate::janitor::Janitor;
use crate::oci::Digest;
use crate::processor::accounts::{AccountRequest, ReplicationPolicy};
use crate::processor::Processor;
use crate::util::Clock;

pub use upstream_stub::UpstreamStub;

pub const TEST_EPOCH: i64 = 1_700_000_000;

pub struct Setup {
    pub db: DbPool,
    pub config: Arc<Configuration>,
    pub memory_storage: Arc<InMemoryDriver>,
    pub sd: Arc<dyn StorageDriver>,
    pub ad: Arc<dyn AuthDriver>,
    pub fd: Arc<dyn FederationDriver>,
    pub api: Arc<Api>,
    pub processor: Processor,
    pub janitor: Janitor,
    pub clock: Arc<AtomicI64>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Setup {
    pub async fn new(hostname: &str) -> Setup {
        Self::with_anycast_key(hostname, &generate_ed25519_pem()).await
    }

    /// Peers validating each other's anycast tokens must share the anycast
    /// issuer key; tests pass the same PEM into both setups.
    pub async fn with_anycast_key(hostname: &str, anycast_pem: &str) -> Setup {
        let config = Arc::new(Configuration {
            api_public_hostname: hostname.to_string(),
            anycast_api_public_hostname: Some(format!("anycast.{hostname}")),
            listen_address: "127.0.0.1:0".parse().unwrap(),
            database_url: "sqlite::memory:".into(),
            issuer_keys: vec![IssuerKey::from_private_key_pem(&generate_ed25519_pem()).unwrap()],
            anycast_issuer_keys: vec![IssuerKey::from_private_key_pem(anycast_pem).unwrap()],
            auth_driver: "static".into(),
            storage_driver: "in-memory".into(),
            federation_driver: "trivial".into(),
            rate_limit_driver: None,
            storage_path: None,
            federation_path: None,
            static_users: vec![StaticUser {
                username: "johndoe".into(),
                password: "SuperSecret".into(),
                auth_tenant_id: "tenant1".into(),
                permissions: vec![
                    "view".into(),
                    "pull".into(),
                    "push".into(),
                    "delete".into(),
                    "change".into(),
                    "viewquota".into(),
                    "changequota".into(),
                ],
            }],
            peers: Vec::new(),
            trivy_url: None,
        });

        let db = db::connect("sqlite::memory:").await.expect("cannot open test database");
        let memory_storage = Arc::new(InMemoryDriver::new());
        let sd: Arc<dyn StorageDriver> = memory_storage.clone();
        let ad: Arc<dyn AuthDriver> = Arc::new(crate::drivers::auth::StaticAuthDriver::new(
            config.static_users.clone(),
        ));
        let fd: Arc<dyn FederationDriver> = Arc::new(TrivialFederationDriver::new(hostname));

        let clock = Arc::new(AtomicI64::new(TEST_EPOCH));
        let clock_for_closure = clock.clone();
        let time_now: Clock = Arc::new(move || clock_for_closure.load(Ordering::SeqCst));

        let api = Api::new(
            db.clone(),
            config.clone(),
            ad.clone(),
            sd.clone(),
            fd.clone(),
            Arc::new(NoopRateLimitDriver),
        );
        let processor = Processor::new(db.clone(), sd.clone(), fd.clone(), config.clone())
            .with_clock(time_now.clone());
        let janitor = Janitor::new(db.clone(), sd.clone(), fd.clone(), config.clone())
            .with_clock(time_now.clone());

        Setup {
            db,
            config,
            memory_storage,
            sd,
            ad,
            fd,
            api,
            processor,
            janitor,
            clock,
            shutdown: None,
        }
    }

    pub fn advance_clock(&self, seconds: i64) {
        self.clock.fetch_add(seconds, Ordering::SeqCst);
    }

    /// Serves the API on a loopback listener and returns its base URL.
    pub async fn serve(&mut self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("cannot bind test listener");
        let address: SocketAddr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        tokio::spawn(crate::command::api::serve(self.api.clone(), listener, shutdown_rx));
        format!("http://{address}")
    }

    pub async fn create_primary_account(&self, name: &str) {
        self.processor
            .create_or_update_account(AccountRequest {
                name: name.to_string(),
                auth_tenant_id: "tenant1".into(),
                replication: None,
                gc_policies: Vec::new(),
                rbac_policies: Vec::new(),
                tag_policies: Vec::new(),
                validation_policy: None,
                platform_filter: None,
                sublease_token_secret: None,
            })
            .await
            .expect("cannot create primary account");
    }

    pub async fn create_external_replica_account(&self, name: &str, upstream_url: &str) {
        self.processor
            .create_or_update_account(AccountRequest {
                name: name.to_string(),
                auth_tenant_id: "tenant1".into(),
                replication: Some(ReplicationPolicy::FromExternalOnFirstUse {
                    url: upstream_url.to_string(),
                    username: String::new(),
                    password: String::new(),
                }),
                gc_policies: Vec::new(),
                rbac_policies: Vec::new(),
                tag_policies: Vec::new(),
                validation_policy: None,
                platform_filter: None,
                sublease_token_secret: None,
            })
            .await
            .expect("cannot create replica account");
    }
}

impl Drop for Setup {
    fn drop(&mut self) {
        if let Some(shutdown) = &self.shutdown {
            let _ = shutdown.send(true);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// HTTP client helpers

pub struct TestClient {
    pub base_url: String,
    pub host: String,
    http: reqwest::Client,
}

impl TestClient {
    pub fn new(base_url: &str, host: &str) -> Self {
        TestClient {
            base_url: base_url.to_string(),
            host: host.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(reqwest::header::HOST, &self.host)
    }

    pub async fn get_token(&self, scopes: &[&str]) -> String {
        let mut query: Vec<(&str, &str)> = vec![("service", self.host.as_str())];
        for scope in scopes {
            query.push(("scope", scope));
        }
        let response = self
            .request(reqwest::Method::GET, "/keppel/v1/auth")
            .query(&query)
            .basic_auth("johndoe", Some("SuperSecret"))
            .send()
            .await
            .expect("token request failed");
        assert_eq!(response.status(), 200, "token request was rejected");
        let body: HashMap<String, serde_json::Value> = response.json().await.unwrap();
        body["token"].as_str().expect("no token in response").to_string()
    }

    pub async fn push_blob(&self, token: &str, repo_path: &str, contents: &[u8]) -> Digest {
        let digest = Digest::of_bytes(contents);
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v2/{repo_path}/blobs/uploads/?digest={digest}"),
            )
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_LENGTH, contents.len())
            .body(contents.to_vec())
            .send()
            .await
            .expect("blob push failed");
        assert_eq!(response.status(), 201, "blob push was rejected");
        digest
    }

    pub async fn push_manifest(
        &self,
        token: &str,
        repo_path: &str,
        reference: &str,
        media_type: &str,
        contents: &[u8],
    ) -> Digest {
        let response = self
            .request(reqwest::Method::PUT, &format!("/v2/{repo_path}/manifests/{reference}"))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, media_type)
            .body(contents.to_vec())
            .send()
            .await
            .expect("manifest push failed");
        assert_eq!(response.status(), 201, "manifest push was rejected");
        Digest::of_bytes(contents)
    }
}
