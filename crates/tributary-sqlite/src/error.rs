use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("table not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Core(#[from] tributary_core::Error),
}

impl SqliteError {
    /// Whether the database itself is unusable, as opposed to a single
    /// statement failing.
    pub fn is_connection(&self) -> bool {
        match self {
            SqliteError::Poisoned => true,
            SqliteError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::PermissionDenied
            ),
            SqliteError::Core(e) => matches!(e, tributary_core::Error::Connection(_)),
            _ => false,
        }
    }
}

impl From<SqliteError> for tributary_core::Error {
    fn from(err: SqliteError) -> Self {
        if err.is_connection() {
            return tributary_core::Error::Connection(err.to_string());
        }
        match err {
            SqliteError::Core(e) => e,
            SqliteError::Serialization(msg) => tributary_core::Error::Storage(msg),
            other => tributary_core::Error::Storage(other.to_string()),
        }
    }
}

pub type SqliteResult<T> = Result<T, SqliteError>;
