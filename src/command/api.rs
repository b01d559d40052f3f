//! The `api` subcommand: serve all HTTP surfaces on one listener until
//! SIGINT, then drain connections within a grace period.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::Error;
use crate::api::Api;
use crate::api::keppel::peering;
use crate::db::DbPool;
use crate::configuration::Configuration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Mirrors the peer list from the environment into the `peers` table, and
/// kicks off credential issuance for peers we cannot talk to yet.
pub async fn sync_peers(db: &DbPool, config: &Configuration) -> Result<(), sqlx::Error> {
    for peer in &config.peers {
        sqlx::query(
            "INSERT INTO peers (hostname, use_for_pull_delegation) VALUES ($1, $2)
             ON CONFLICT (hostname) DO UPDATE SET use_for_pull_delegation = $2",
        )
        .bind(&peer.hostname)
        .bind(peer.use_for_pull_delegation)
        .execute(db)
        .await?;
    }
    Ok(())
}

/// Accept loop: one task per connection, stopped by the shutdown signal.
pub async fn serve(api: Arc<Api>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        let (stream, remote_address) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("cannot accept connection: {err}");
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };
        debug!("accepted connection from {remote_address}");

        let api = api.clone();
        let mut conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let api = api.clone();
                async move { Ok::<_, Infallible>(api.handle(request).await) }
            });
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        debug!("error serving connection from {remote_address}: {err}");
                    }
                }
                _ = conn_shutdown.changed() => {
                    // stop taking new requests, let in-flight ones finish
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.as_mut().await;
                }
            }
        });
    }
}

pub async fn run(api: Arc<Api>) -> Result<(), Error> {
    sync_peers(&api.db, &api.config).await?;

    // best-effort: establish replication credentials with peers that have none
    {
        let db = api.db.clone();
        let config = api.config.clone();
        tokio::spawn(async move {
            peering::issue_missing_peer_credentials(&db, &config).await;
        });
    }

    let listener = TcpListener::bind(api.config.listen_address).await?;
    info!("listening on {}", api.config.listen_address);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve(api, listener, shutdown_rx));

    // two-phase shutdown: first SIGINT cancels all work, then a grace period
    // lets in-flight requests finish
    tokio::signal::ctrl_c().await?;
    info!("received SIGINT, shutting down (grace period {SHUTDOWN_GRACE:?})");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, server).await;
    info!("shutdown complete");
    Ok(())
}
