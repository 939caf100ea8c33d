use std::fmt;

use crate::types::ParameterId;

const CONFLICT_HINT: &str = "check that the tank has power and a network connection";

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    Status { status: u16, body: String },
    Conflict(String),
    Protocol(String),
    UnknownParameter(ParameterId),
    UnknownSetting(String),
    Config(String),
    InvalidSample(String),
    InvalidValue(String),
    Reinstall(String),
    Deleted,
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Status { .. } | Error::Conflict(_) | Error::Protocol(_)
        )
    }

    pub fn reason(&self) -> String {
        match self {
            Error::Reinstall(msg) => {
                format!("{msg}. Remove the device and add it again (reinstall required)")
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Status { status, body } => write!(f, "HTTP status {status}: {body}"),
            Error::Conflict(msg) => write!(f, "409 Conflict: {msg} ({CONFLICT_HINT})"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::UnknownParameter(id) => write!(f, "unknown parameter id: {id}"),
            Error::UnknownSetting(name) => write!(f, "unknown setting: {name}"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::InvalidSample(msg) => write!(f, "invalid leakage sample: {msg}"),
            Error::InvalidValue(msg) => write!(f, "refusing to write non-finite value {msg}"),
            Error::Reinstall(msg) => write!(f, "device setup is broken: {msg}"),
            Error::Deleted => write!(f, "device has been deleted"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
