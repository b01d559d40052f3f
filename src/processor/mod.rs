//! The processor owns all domain transactions that span the database and the
//! storage driver. The write discipline throughout: storage before DB commit
//! for creates (a crash leaves orphan storage for the storage-sweep to
//! reclaim), DB before storage for deletes (a crash leaves orphan storage,
//! never a dangling DB reference).

pub mod accounts;
pub mod blobs;
pub mod manifests;

use std::sync::Arc;

use crate::client::RepoClient;
use crate::configuration::Configuration;
use crate::db::{self, Account, DbPool, Repo};
use crate::drivers::{FederationDriver, StorageDriver};
use crate::errors::RegistryV2Error;
use crate::util::{wall_clock, Clock};

#[derive(Clone)]
pub struct Processor {
    pub(crate) db: DbPool,
    pub(crate) sd: Arc<dyn StorageDriver>,
    pub(crate) fd: Arc<dyn FederationDriver>,
    pub(crate) config: Arc<Configuration>,
    pub(crate) time_now: Clock,
}

impl Processor {
    pub fn new(
        db: DbPool,
        sd: Arc<dyn StorageDriver>,
        fd: Arc<dyn FederationDriver>,
        config: Arc<Configuration>,
    ) -> Self {
        Processor {
            db,
            sd,
            fd,
            config,
            time_now: wall_clock(),
        }
    }

    /// Overrides the time source; used by tests to control job clocks.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.time_now = clock;
        self
    }

    pub(crate) fn now(&self) -> i64 {
        (self.time_now)()
    }

    /// Builds a client for pulling from the upstream of a replica account.
    pub(crate) async fn repo_client_for_upstream(
        &self,
        account: &Account,
        repo: &Repo,
    ) -> Result<RepoClient, RegistryV2Error> {
        if account.is_internal_replica() {
            let peer = db::find_peer(&self.db, &account.upstream_peer_hostname)
                .await?
                .ok_or_else(|| {
                    RegistryV2Error::Internal(format!(
                        "upstream peer {:?} is not registered",
                        account.upstream_peer_hostname
                    ))
                })?;
            // on the peer, the repository lives under the same account name
            return Ok(RepoClient::for_peer(
                &peer,
                &self.config.api_public_hostname,
                &repo.full_name(),
            ));
        }
        if account.is_external_replica() {
            return RepoClient::for_external(account, &repo.name);
        }
        Err(RegistryV2Error::Internal(format!(
            "account {:?} is not a replica, nothing to pull from",
            account.name
        )))
    }
}
