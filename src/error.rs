use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage quota exceeded while writing '{0}'")]
    QuotaExceeded(String),

    #[error("storage backend does not support compare-and-set")]
    AtomicUnsupported,

    #[error("compare-and-set on '{0}' kept losing to concurrent writers")]
    Contended(String),

    #[error("transport '{0}' unavailable: {1}")]
    TransportUnavailable(&'static str, String),

    #[error("tab guard has been destroyed")]
    Destroyed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl GuardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::AtomicUnsupported => "atomic_unsupported",
            Self::Contended(_) => "contended",
            Self::TransportUnavailable(_, _) => "transport_unavailable",
            Self::Destroyed => "destroyed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Locked(_) => "locked",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Db(_) => "db_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
