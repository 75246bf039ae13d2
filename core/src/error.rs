use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote unavailable{}: {}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default(), .details)]
    RemoteUnavailable { status: Option<u16>, details: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("cursor store error: {0}")]
    CursorStore(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("a sync cycle for '{0}' is already in progress")]
    CycleInProgress(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::RemoteUnavailable { .. } | Error::Io(_) | Error::CursorStore(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Validation(_))
    }

    /// True when the failure says nothing about the record being written, only
    /// that the database could not be reached.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Short label used for metrics and cycle summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Serialization(_) => "serialization",
            Error::Auth(_) => "auth_failure",
            Error::RemoteUnavailable { .. } => "remote_unavailable",
            Error::MalformedResponse(_) => "malformed_response",
            Error::CursorStore(_) => "cursor_store",
            Error::Validation(_) => "validation",
            Error::CycleInProgress(_) => "cycle_in_progress",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
