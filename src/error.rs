use std::sync::Arc;

use reqwest::StatusCode;

/// Represents a result type for operations in the Flagship SDK.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// flagship-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Flagship SDK.
///
/// Errors never escape flag reads: they are returned from fetch, flush and lifecycle operations,
/// and reported to status listeners.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was rejected, the environment id or api key is likely invalid.
    #[error("unauthorized, env_id or api_key is likely invalid")]
    Unauthorized,

    /// Network error (connection failure, DNS, TLS, ...).
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-2xx status.
    #[error("unexpected response status: {0}")]
    Status(StatusCode),

    /// Local decisions were requested before any bucketing file was fetched or restored.
    #[error("bucketing file has not been fetched yet")]
    ConfigurationNotFetched,

    /// A response body or a cached payload could not be parsed.
    #[error("failed to parse payload")]
    Parse(#[source] Arc<serde_json::Error>),

    /// The persistence collaborator failed.
    #[error("cache error: {0}")]
    Cache(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Indicates that a background task panicked. This should normally never happen.
    #[error("background task panicked")]
    TaskPanicked,
}

impl Error {
    /// Returns `true` for errors that will not go away by retrying the same request.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Unauthorized | Error::InvalidBaseUrl(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Error::Timeout;
        }
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(_: tokio::task::JoinError) -> Self {
        Error::TaskPanicked
    }
}
