use serde_derive::{Deserialize, Serialize};

/// A trikv result.
pub type Result<T> = std::result::Result<T, Error>;

/// A trikv error. Serializable, since transaction outcomes cross the
/// client/server boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The transaction was aborted.
    Abort,
    /// An internal defect: a protocol violation, a log replay inconsistency,
    /// or a violated invariant. Fatal for the local node process.
    Internal(String),
    /// Invalid user input, e.g. a malformed command line. The input is
    /// reported and dropped, and never reaches the protocol core.
    InvalidInput(String),
    /// An input/output error.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "transaction aborted"),
            Error::Internal(s) => write!(f, "internal error: {s}"),
            Error::InvalidInput(s) => write!(f, "invalid input: {s}"),
            Error::IO(s) => write!(f, "io error: {s}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}
