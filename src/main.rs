#![forbid(unsafe_code)]

use argh::FromArgs;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod api;
mod auth;
mod client;
mod command;
mod configuration;
mod db;
mod drivers;
mod duration;
mod errors;
mod janitor;
mod metrics;
mod oci;
mod policies;
mod processor;
#[cfg(test)]
mod testing;
mod util;

use configuration::Configuration;
use drivers::{AUTH_DRIVERS, FEDERATION_DRIVERS, RATE_LIMIT_DRIVERS, STORAGE_DRIVERS};

/// A multi-tenant container image registry with account federation and
/// on-first-use replication.
#[derive(FromArgs)]
struct GlobalArguments {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum SubCommand {
    Api(ApiOptions),
    Janitor(JanitorOptions),
}

/// Serve the registry, Keppel and auth APIs.
#[derive(FromArgs)]
#[argh(subcommand, name = "api")]
struct ApiOptions {}

/// Run all maintenance job loops.
#[derive(FromArgs)]
#[argh(subcommand, name = "janitor")]
struct JanitorOptions {}

fn main() -> Result<(), command::Error> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let arguments: GlobalArguments = argh::from_env();
    let config = Arc::new(Configuration::from_env()?);

    drivers::register_builtin_drivers();
    let ad = AUTH_DRIVERS.build(&config.auth_driver, &config)?;
    let sd = STORAGE_DRIVERS.build(&config.storage_driver, &config)?;
    let fd = FEDERATION_DRIVERS.build(&config.federation_driver, &config)?;
    let rld = match &config.rate_limit_driver {
        Some(driver_id) => RATE_LIMIT_DRIVERS.build(driver_id, &config)?,
        None => RATE_LIMIT_DRIVERS.build("noop", &config)?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async move {
        let db = db::connect(&config.database_url).await?;
        info!("connected to database at {}", config.database_url);

        match arguments.command {
            SubCommand::Api(_) => {
                let api = api::Api::new(db, config, ad, sd, fd, rld);
                command::api::run(api).await
            }
            SubCommand::Janitor(_) => {
                let janitor = janitor::Janitor::new(db, sd, fd, config);
                command::janitor::run(janitor).await
            }
        }
    })
}
