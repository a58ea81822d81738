use serde::{Deserialize, Serialize};

/// tsmeta errors. Errors are part of the wire protocol: a command that fails
/// validation is still committed to the log, and the resulting error travels
/// back to the submitter inside the execute response, so Error must be
/// serializable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted because the client or store is closing.
    Abort,
    /// Authentication failed: the password did not match.
    Authenticate,
    /// Invalid or corrupt data, typically an encoding or protocol error.
    InvalidData(String),
    /// An invalid command or argument, e.g. a conflicting retention policy.
    InvalidInput(String),
    /// An IO or network error. Considered retryable.
    IO(String),
    /// The requested entity does not exist.
    NotFound(String),
    /// The request hit a follower; retry against the given HTTP address.
    Redirect(String),
    /// The meta service is temporarily unavailable. Considered retryable.
    Unavailable(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::Authenticate => write!(f, "authentication failed"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Redirect(host) => write!(f, "redirect to {host}"),
            Error::Unavailable(msg) => write!(f, "meta service unavailable: {msg}"),
        }
    }
}

impl Error {
    /// Returns true if the error is transient and the request can be retried
    /// against another meta server, per the transport error policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::IO(_) | Error::Unavailable(_))
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows converting an Error directly into a Result, which in particular
/// makes the errdata!/errinput! macros usable both as errors and results.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bcrypt::BcryptError> for Error {
    fn from(err: bcrypt::BcryptError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
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
