//! The peering handshake. A peer announces freshly issued credentials with
//! `POST /keppel/v1/auth/peering`; we verify that the credentials actually
//! work against the announcing peer before storing them. The reverse
//! direction (issuing new passwords for our peers) runs at API startup.

use hyper::body::Incoming;
use hyper::{Response, StatusCode};
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use tracing::{error, info};

use crate::api::body::{self, Body};
use crate::api::{collect_body, Api};
use crate::client::peer::{PeerClient, PeeringRequest};
use crate::configuration::Configuration;
use crate::db::{self, DbPool};
use crate::errors::RegistryV2Error;

pub async fn handle_announcement(
    api: &Api,
    request_body: Incoming,
) -> Result<Response<Body>, RegistryV2Error> {
    let payload = collect_body(request_body, 64 << 10).await?;
    let request: PeeringRequest = serde_json::from_slice(&payload)
        .map_err(|err| RegistryV2Error::ManifestInvalid(format!("malformed request body: {err}")))?;

    if db::find_peer(&api.db, &request.peer_hostname).await?.is_none() {
        return Err(RegistryV2Error::Denied(format!(
            "{:?} is not a known peer",
            request.peer_hostname
        )));
    }

    // The announcement itself is unauthenticated; its proof is that the
    // announced credentials work against the announcing peer.
    let client = reqwest::Client::new();
    let response = client
        .get(format!("https://{}/keppel/v1/auth", request.peer_hostname))
        .query(&[("service", request.peer_hostname.as_str())])
        .basic_auth(
            format!("replication@{}", api.config.api_public_hostname),
            Some(&request.password),
        )
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(RegistryV2Error::Unauthorized(format!(
            "announced credentials were rejected by {:?}",
            request.peer_hostname
        )));
    }

    sqlx::query("UPDATE peers SET our_password = $2, last_peered_at = $3 WHERE hostname = $1")
        .bind(&request.peer_hostname)
        .bind(&request.password)
        .bind(api.processor.now())
        .execute(&api.db)
        .await?;

    info!("accepted new replication credentials from peer {:?}", request.peer_hostname);
    Ok(Response::builder().status(StatusCode::NO_CONTENT).body(body::empty())?)
}

/// Issues fresh credentials for every configured peer that does not have any
/// yet, and announces them. Failures are logged, not fatal: peering repairs
/// itself on the next startup.
pub async fn issue_missing_peer_credentials(db: &DbPool, config: &Configuration) {
    let peers: Vec<db::Peer> =
        match sqlx::query_as("SELECT * FROM peers WHERE their_current_password_hash = ''")
            .fetch_all(db)
            .await
        {
            Ok(peers) => peers,
            Err(err) => {
                error!("cannot list peers for credential issuance: {err}");
                return;
            }
        };

    for peer in peers {
        let mut password_bytes = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut password_bytes);
        let password = hex::encode(password_bytes);
        let password_hash = hex::encode(Sha256::digest(password.as_bytes()));

        let update = sqlx::query(
            "UPDATE peers SET their_previous_password_hash = their_current_password_hash,
                              their_current_password_hash = $2
              WHERE hostname = $1",
        )
        .bind(&peer.hostname)
        .bind(&password_hash)
        .execute(db)
        .await;
        if let Err(err) = update {
            error!("cannot store new credentials for peer {:?}: {err}", peer.hostname);
            continue;
        }

        let client = PeerClient::new(&peer, &config.api_public_hostname);
        if let Err(err) = client.announce_peering(&password).await {
            error!("cannot announce new credentials to peer {:?}: {err}", peer.hostname);
        } else {
            info!("issued new replication credentials for peer {:?}", peer.hostname);
        }
    }
}
