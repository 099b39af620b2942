use thiserror::Error;

/// Errors raised by tracking backends.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{backend} request to {endpoint} failed with HTTP {status}: {body}")]
    Status {
        backend: &'static str,
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The server answered, but not with what the protocol promises.
    #[error("{backend} protocol error: {reason}")]
    Protocol {
        backend: &'static str,
        reason: String,
    },

    /// A required credential is not configured.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// The session was already finished.
    #[error("{0} run is already finished")]
    Finished(String),

    /// One backend of a fan-out failed.
    #[error("tracker {backend} failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: Box<TrackingError>,
    },

    /// Filesystem failure (offline sessions, artifact reads).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;
