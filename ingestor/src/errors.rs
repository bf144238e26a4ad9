use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the storage engine, reported per call and never retried here.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the failure is likely to clear up on its own (busy database,
    /// exhausted pool, I/O hiccup) as opposed to a schema or constraint problem.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
                    code == "5" || // SQLITE_BUSY
                    code == "6" || // SQLITE_LOCKED
                    code == "517" // SQLITE_BUSY_SNAPSHOT
                }),
                _ => false,
            },
            StorageError::Io(_) => true,
            StorageError::Migration(_) => false,
        }
    }
}

/// Reasons an inbound payload could not be turned into a reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing device_id")]
    MissingDeviceId,

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}
