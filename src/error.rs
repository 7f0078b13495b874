use thiserror::Error;

/// Error taxonomy shared by the engines and surfaced over the API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown interval: {0}")]
    BadInterval(String),

    #[error("{0}")]
    BadInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// Market-data client exhausted its retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Requested range produced an empty or too-short frame.
    #[error("{0}")]
    DataUnavailable(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// True when a sqlx error is a unique-constraint violation. Signal and
/// notification dedup rely on the insert failing rather than a pre-query.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}
