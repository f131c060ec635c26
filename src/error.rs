// src/error.rs
//! Error taxonomy shared by the store, reporters and the supervisor.

use std::path::PathBuf;

use rusqlite::ErrorCode;

pub type Result<T, E = AtlasError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// Store file missing, locked by another writer, or not writable.
    #[error("store unavailable at {path}: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },

    /// An insert would break the `(source, url)` uniqueness.
    #[error("duplicate signal for source={source_name:?} url={url:?}")]
    ConstraintViolation { source_name: String, url: String },

    #[error("upstream fetch failed for {target}: {reason}")]
    UpstreamFetchFailure { target: String, reason: String },

    /// The supervised dashboard did not come up. `output` holds the tail of its log.
    #[error("dashboard on port {port} not live: {reason}")]
    ProcessLivenessFailure {
        port: u16,
        reason: String,
        output: String,
    },

    /// A schema step failed; the whole pending batch was rolled back.
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AtlasError {
    /// Lift a rusqlite error into `StoreUnavailable` when it signals a lock,
    /// permission or open failure; everything else stays a plain SQLite error.
    pub fn from_sqlite(path: impl Into<PathBuf>, err: rusqlite::Error) -> Self {
        if is_unavailable(&err) {
            return AtlasError::StoreUnavailable {
                path: path.into(),
                reason: err.to_string(),
            };
        }
        AtlasError::Sqlite(err)
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AtlasError::StoreUnavailable { .. })
    }

    /// Process exit code used by the `atlas` binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            AtlasError::UpstreamFetchFailure { .. } | AtlasError::ProcessLivenessFailure { .. } => 2,
            _ => 1,
        }
    }
}

pub(crate) fn is_unavailable(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::ReadOnly
                | ErrorCode::CannotOpen
                | ErrorCode::PermissionDenied
                | ErrorCode::NotADatabase
        ),
        _ => false,
    }
}
