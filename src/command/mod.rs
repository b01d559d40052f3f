pub mod api;
pub mod janitor;

use std::fmt::{self, Display, Formatter};

use crate::configuration;
use crate::drivers::DriverError;

#[derive(Debug)]
pub enum Error {
    Configuration(configuration::Error),
    Driver(DriverError),
    Database(sqlx::Error),
    Io(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(err) => write!(f, "configuration error: {err}"),
            Error::Driver(err) => write!(f, "driver error: {err}"),
            Error::Database(err) => write!(f, "database error: {err}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<configuration::Error> for Error {
    fn from(err: configuration::Error) -> Self {
        Error::Configuration(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
