use std::fmt::{self, Display, Formatter};

#[derive(Debug)]
pub enum Error {
    Missing(&'static str),
    Invalid(&'static str, String),
    Io(String, std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Missing(name) => write!(f, "missing required environment variable: {name}"),
            Error::Invalid(name, reason) => write!(f, "invalid value for {name}: {reason}"),
            Error::Io(path, err) => write!(f, "cannot read {path}: {err}"),
        }
    }
}

impl std::error::Error for Error {}
