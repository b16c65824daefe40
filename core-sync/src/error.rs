use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Representation {id} not found in project {project}")]
    RepresentationNotFound { id: String, project: String },

    #[error("File {file_id} not found on representation {representation_id}")]
    FileNotFound {
        representation_id: String,
        file_id: String,
    },

    #[error("Site {site} already present")]
    SiteAlreadyPresent { site: String },

    #[error("Site {site} not found")]
    SiteNotFound { site: String },

    #[error("Project {0} is not configured for sync")]
    ProjectNotConfigured(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider error: {0}")]
    Provider(#[from] BridgeError),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Sync server is already running")]
    AlreadyRunning,

    #[error("Sync server is not running")]
    NotRunning,

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Database connection reset: {0}")]
    ConnectionReset(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the next loop iteration is expected to succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionReset(_) | SyncError::Settings(_) | SyncError::Cancelled
        )
    }
}

/// Map a `sqlx` failure, separating dropped connections from query errors.
pub(crate) fn db_error(error: sqlx::Error) -> SyncError {
    match &error {
        sqlx::Error::Io(io) if is_connection_reset(io.kind()) => {
            SyncError::ConnectionReset(error.to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            SyncError::ConnectionReset(error.to_string())
        }
        _ => SyncError::Database(error.to_string()),
    }
}

fn is_connection_reset(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;

    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

pub type Result<T> = std::result::Result<T, SyncError>;
