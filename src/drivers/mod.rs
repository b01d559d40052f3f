//! Driver plugin registries. Drivers are selected by string ID at startup;
//! every built-in driver registers a factory closure here before the first
//! `build` call, and site-specific builds can register additional ones.

pub mod auth;
pub mod federation;
pub mod ratelimit;
pub mod storage;

pub use auth::{AuthDriver, Permission, UserIdentity, UserType};
pub use federation::{ClaimResult, FederationDriver, FederationError};
pub use ratelimit::{RateLimitDriver, RateLimitedAction};
pub use storage::{StorageDriver, StorageError};

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, RwLock};

use crate::configuration::Configuration;

#[derive(Debug)]
pub enum DriverError {
    UnknownDriver(&'static str, String),
    Setup(String),
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::UnknownDriver(kind, id) => write!(f, "no such {kind} driver: {id:?}"),
            DriverError::Setup(msg) => write!(f, "cannot initialize driver: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {}

type Factory<T> = Box<dyn Fn(&Configuration) -> Result<Arc<T>, DriverError> + Send + Sync>;

/// A registry of driver factories indexed by plugin ID. Registration happens
/// once at startup; afterwards the registry is read-only.
pub struct DriverRegistry<T: ?Sized> {
    kind: &'static str,
    factories: RwLock<HashMap<String, Factory<T>>>,
}

impl<T: ?Sized> DriverRegistry<T> {
    fn new(kind: &'static str) -> Self {
        DriverRegistry {
            kind,
            factories: RwLock::new(HashMap::new()),
        }
    }

    pub fn add<F>(&self, plugin_type_id: &str, factory: F)
    where
        F: Fn(&Configuration) -> Result<Arc<T>, DriverError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap()
            .insert(plugin_type_id.to_string(), Box::new(factory));
    }

    pub fn build(&self, plugin_type_id: &str, config: &Configuration) -> Result<Arc<T>, DriverError> {
        let factories = self.factories.read().unwrap();
        let factory = factories
            .get(plugin_type_id)
            .ok_or_else(|| DriverError::UnknownDriver(self.kind, plugin_type_id.to_string()))?;
        factory(config)
    }
}

lazy_static! {
    pub static ref AUTH_DRIVERS: DriverRegistry<dyn AuthDriver> = DriverRegistry::new("auth");
    pub static ref STORAGE_DRIVERS: DriverRegistry<dyn StorageDriver> = DriverRegistry::new("storage");
    pub static ref FEDERATION_DRIVERS: DriverRegistry<dyn FederationDriver> = DriverRegistry::new("federation");
    pub static ref RATE_LIMIT_DRIVERS: DriverRegistry<dyn RateLimitDriver> = DriverRegistry::new("rate limit");
}

/// Registers the built-in drivers. Must run before any `build` call; calling
/// it more than once is harmless.
pub fn register_builtin_drivers() {
    AUTH_DRIVERS.add("static", |config| {
        Ok(Arc::new(auth::StaticAuthDriver::new(config.static_users.clone())))
    });

    STORAGE_DRIVERS.add("in-memory", |_config| Ok(Arc::new(storage::memory::InMemoryDriver::new())));
    STORAGE_DRIVERS.add("filesystem", |config| {
        let root = config
            .storage_path
            .clone()
            .ok_or_else(|| DriverError::Setup("KEPPEL_STORAGE_PATH is required for the filesystem storage driver".into()))?;
        Ok(Arc::new(storage::filesystem::FilesystemDriver::new(root)))
    });

    FEDERATION_DRIVERS.add("trivial", |config| {
        Ok(Arc::new(federation::TrivialFederationDriver::new(config.api_public_hostname.clone())))
    });
    FEDERATION_DRIVERS.add("shared-file", |config| {
        let directory = config
            .federation_path
            .clone()
            .ok_or_else(|| DriverError::Setup("KEPPEL_FEDERATION_PATH is required for the shared-file federation driver".into()))?;
        federation::shared_file::check_directory(&directory)
            .map_err(|err| DriverError::Setup(format!("cannot use {}: {}", directory.display(), err)))?;
        Ok(Arc::new(federation::shared_file::SharedFileFederationDriver::new(
            directory,
            config.api_public_hostname.clone(),
        )))
    });

    RATE_LIMIT_DRIVERS.add("noop", |_config| Ok(Arc::new(ratelimit::NoopRateLimitDriver)));
}
