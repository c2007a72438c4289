use serde_derive::{Deserialize, Serialize};

/// toyvote errors. All except Fatal are recoverable: the server logs them and
/// keeps running. Errors are serializable so they can be returned to clients
/// across the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data, typically a malformed or unexpected message.
    InvalidData(String),
    /// Invalid user input.
    InvalidInput(String),
    /// An IO error. Wraps the message only, since std::io::Error isn't
    /// serializable nor clonable.
    IO(String),
    /// An unrecoverable startup error (bind failure, multicast join failure).
    /// Terminates the process with a non-zero exit code.
    Fatal(String),
    /// A structured service error returned by the leader, e.g. an auth
    /// failure or a duplicate group name. See message::ServiceError.
    Service(crate::message::ServiceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Fatal(msg) => write!(f, "fatal: {msg}"),
            Error::Service(err) => write!(f, "{} {err}", err.code()),
        }
    }
}

impl From<crate::message::ServiceError> for Error {
    fn from(err: crate::message::ServiceError) -> Self {
        Error::Service(err)
    }
}

/// Constructs an Err(Error::InvalidData) via format!().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

/// Constructs an Err(Error::InvalidInput) via format!().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
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
        Error::Fatal(err.to_string())
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
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}

/// A toyvote Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
