//! Client for the Keppel API of a peer deployment: foreign account
//! configuration lookups and the peering handshake.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::db::Peer;
use crate::errors::RegistryV2Error;
use crate::oci::PlatformFilter;

/// The subset of a foreign account's configuration that replica validation
/// needs. Matches the `{"account": ...}` shape served by the Keppel API.
#[derive(Debug, Deserialize)]
pub struct ForeignAccountConfig {
    pub name: String,
    #[serde(default)]
    pub auth_tenant_id: String,
    #[serde(default)]
    pub platform_filter: PlatformFilter,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeeringRequest {
    /// Hostname of the keppel announcing new credentials.
    pub peer_hostname: String,
    /// The password that peer will use with its replication user from now on.
    pub password: String,
}

pub struct PeerClient {
    http: reqwest::Client,
    peer_hostname: String,
    own_hostname: String,
    password: String,
}

impl PeerClient {
    pub fn new(peer: &Peer, own_hostname: &str) -> Self {
        PeerClient {
            http: reqwest::Client::new(),
            peer_hostname: peer.hostname.clone(),
            own_hostname: own_hostname.to_string(),
            password: peer.our_password.clone(),
        }
    }

    fn basic_auth_header(&self) -> String {
        let credentials = format!("replication@{}:{}", self.own_hostname, self.password);
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }

    async fn get_token(&self, scope: &str) -> Result<String, RegistryV2Error> {
        #[derive(Deserialize)]
        struct TokenBody {
            token: String,
        }

        let url = format!("https://{}/keppel/v1/auth", self.peer_hostname);
        let response = self
            .http
            .get(&url)
            .query(&[("service", self.peer_hostname.as_str()), ("scope", scope)])
            .header(reqwest::header::AUTHORIZATION, self.basic_auth_header())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryV2Error::Unauthorized(format!(
                "peer {} refused to issue a token: {}",
                self.peer_hostname,
                response.status()
            )));
        }
        let body: TokenBody = response.json().await?;
        Ok(body.token)
    }

    /// Fetches the configuration of the account as the peer sees it. Used to
    /// validate that a replica's platform filter matches the primary's.
    pub async fn get_foreign_account_config(
        &self,
        account_name: &str,
    ) -> Result<ForeignAccountConfig, RegistryV2Error> {
        #[derive(Deserialize)]
        struct Envelope {
            account: ForeignAccountConfig,
        }

        let token = self.get_token(&format!("keppel_account:{account_name}:view")).await?;
        let url = format!("https://{}/keppel/v1/accounts/{}", self.peer_hostname, account_name);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => return Err(RegistryV2Error::NameUnknown),
            status => {
                return Err(RegistryV2Error::Internal(format!(
                    "peer {} returned {status} for account configuration",
                    self.peer_hostname
                )))
            }
        }
        let envelope: Envelope = response.json().await?;
        Ok(envelope.account)
    }

    /// Announces freshly issued replication credentials to the peer. The peer
    /// verifies them by calling back our auth endpoint before storing them.
    pub async fn announce_peering(&self, new_password: &str) -> Result<(), RegistryV2Error> {
        let url = format!("https://{}/keppel/v1/auth/peering", self.peer_hostname);
        let body = PeeringRequest {
            peer_hostname: self.own_hostname.clone(),
            password: new_password.to_string(),
        };
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(RegistryV2Error::Internal(format!(
                "peer {} rejected peering handshake: {}",
                self.peer_hostname,
                response.status()
            )));
        }
        Ok(())
    }
}
