use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload error: {0}")]
    Core(#[from] kiwatch_core::CoreError),

    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

impl StorageError {
    /// True when the backing database could not be reached at all, as opposed to
    /// a statement-level failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}
