use serde::{Deserialize, Serialize};

use crate::storage::mvcc::TxIndex;

/// occdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The attempt read an estimate written by the given transaction, whose
    /// final value is not yet known. The attempt must stop immediately and be
    /// retried with a new incarnation. Never surfaced to batch callers.
    Abort(TxIndex),
    /// A transaction's business logic failed. This is a final outcome.
    Application(String),
    /// The scheduler was cancelled before reaching a fixed point.
    Cancelled,
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically configuration errors.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A transaction attempt panicked. The panic was recovered and its message
    /// retained, so the outcome is deterministic like an application error.
    Panic(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort(index) => write!(f, "aborted: read estimate written by txn {index}"),
            Error::Application(msg) => write!(f, "{msg}"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

impl Error {
    /// Returns whether the error is deterministic, i.e. a function of the
    /// transaction and the state it observed. Deterministic errors are final
    /// transaction outcomes, others are scheduler or infrastructure failures.
    pub fn is_deterministic(&self) -> bool {
        match self {
            Error::Application(_) | Error::Panic(_) => true,
            Error::Abort(_)
            | Error::Cancelled
            | Error::InvalidData(_)
            | Error::InvalidInput(_)
            | Error::IO(_) => false,
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An occdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvTimeoutError> for Error {
    fn from(err: crossbeam::channel::RecvTimeoutError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::TryRecvError> for Error {
    fn from(err: crossbeam::channel::TryRecvError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
