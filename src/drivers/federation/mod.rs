//! The federation driver arbitrates account-name ownership across peers.
//! Claiming happens at account creation, forfeiting at account deletion, and
//! the janitor periodically re-announces existing accounts to repair drift.

pub mod shared_file;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;

use crate::db::Account;

#[derive(Debug)]
pub enum FederationError {
    /// A concurrent writer raced us; the caller should retry.
    WriteCollision(String),
    Backend(String),
}

impl Display for FederationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FederationError::WriteCollision(account) => {
                write!(f, "write collision while updating the claim for account {account:?}, please retry")
            }
            FederationError::Backend(msg) => write!(f, "federation driver error: {msg}"),
        }
    }
}

impl std::error::Error for FederationError {}

impl From<std::io::Error> for FederationError {
    fn from(err: std::io::Error) -> Self {
        FederationError::Backend(err.to_string())
    }
}

/// The three-way outcome of a name claim. `Failed` is the user's fault
/// (name taken, bad sublease token) and maps to 403; `Errored` is ours and
/// maps to 500.
#[derive(Debug)]
pub enum ClaimResult {
    Succeeded,
    Failed(String),
    Errored(String),
}

#[async_trait]
pub trait FederationDriver: Send + Sync {
    fn plugin_type_id(&self) -> &'static str;

    /// Claims the account name for this deployment. For replica accounts,
    /// `sublease_token_secret` must be the one-shot secret issued by the
    /// primary. Claiming is idempotent for the same (account, secret) pair.
    async fn claim_account_name(&self, account: &Account, sublease_token_secret: &str) -> ClaimResult;

    /// Issues a fresh one-shot secret enabling another peer to create a
    /// replica of this (primary) account.
    async fn issue_sublease_token_secret(&self, account: &Account) -> Result<String, FederationError>;

    /// Releases the name claim while the account is being deleted.
    async fn forfeit_account_name(&self, account: &Account) -> Result<(), FederationError>;

    /// Re-announces an account that exists in our database, repairing any
    /// drift in the shared claim state.
    async fn record_existing_account(&self, account: &Account, now: i64) -> Result<(), FederationError>;

    /// Looks up which peer hosts the primary account for this name.
    /// `Ok(None)` means no such primary account exists anywhere.
    async fn find_primary_account(&self, account_name: &str) -> Result<Option<String>, FederationError>;
}

////////////////////////////////////////////////////////////////////////////////
// "trivial" driver: no cross-deployment arbitration

/// Grants every claim. Suitable for deployments without peers; primaries are
/// tracked in process memory only so that `find_primary_account` works in
/// tests.
pub struct TrivialFederationDriver {
    own_hostname: String,
    known_primaries: Mutex<HashMap<String, String>>,
}

impl TrivialFederationDriver {
    pub fn new(own_hostname: impl Into<String>) -> Self {
        TrivialFederationDriver {
            own_hostname: own_hostname.into(),
            known_primaries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FederationDriver for TrivialFederationDriver {
    fn plugin_type_id(&self) -> &'static str {
        "trivial"
    }

    async fn claim_account_name(&self, account: &Account, _sublease_token_secret: &str) -> ClaimResult {
        if !account.is_internal_replica() {
            self.known_primaries
                .lock()
                .unwrap()
                .insert(account.name.clone(), self.own_hostname.clone());
        }
        ClaimResult::Succeeded
    }

    async fn issue_sublease_token_secret(&self, _account: &Account) -> Result<String, FederationError> {
        Ok(String::new())
    }

    async fn forfeit_account_name(&self, account: &Account) -> Result<(), FederationError> {
        self.known_primaries.lock().unwrap().remove(&account.name);
        Ok(())
    }

    async fn record_existing_account(&self, account: &Account, _now: i64) -> Result<(), FederationError> {
        let primary = if account.is_internal_replica() {
            account.upstream_peer_hostname.clone()
        } else {
            self.own_hostname.clone()
        };
        self.known_primaries.lock().unwrap().insert(account.name.clone(), primary);
        Ok(())
    }

    async fn find_primary_account(&self, account_name: &str) -> Result<Option<String>, FederationError> {
        Ok(self.known_primaries.lock().unwrap().get(account_name).cloned())
    }
}
