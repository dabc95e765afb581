use std::sync::Arc;

/// Represents a result type for fallible operations in the FeatureHub SDK.
///
/// Ordinary connectivity problems are never surfaced through `Result`. They are reflected in
/// [`Readiness`](crate::Readiness) instead.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the FeatureHub SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The edge URL could not be parsed.
    #[error("invalid edge_url configuration")]
    InvalidEdgeUrl(#[source] url::ParseError),

    /// No API key was supplied.
    #[error("at least one api key is required")]
    MissingApiKey,

    /// An I/O error (e.g., worker threads failed to start).
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// A payload could not be (de)serialized.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
