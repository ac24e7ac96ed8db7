use thiserror::Error;

#[derive(Error, Debug)]
pub enum SagaError {
    /// Pre-image could not be captured; the forward statement must not run.
    #[error("Snapshot capture error: {0}")]
    SnapshotCapture(String),

    /// A forward or compensation statement failed on its data source.
    #[error("Transport execution error on '{data_source}': {message}")]
    TransportExecution { data_source: String, message: String },

    #[error("Unrecoverable saga error: {0}")]
    UnrecoverableSaga(String),

    #[error("Unsupported statement: {0}")]
    UnsupportedStatement(String),

    /// Raised by the transport when the rollback tag is reached.
    #[error("Forced rollback: {0}")]
    ForcedRollback(String),

    #[error("Transaction rolled back: {0}")]
    RolledBack(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SagaError {
    pub fn transport(data_source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportExecution {
            data_source: data_source.into(),
            message: message.into(),
        }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportExecution { .. })
    }
}

pub type Result<T> = std::result::Result<T, SagaError>;

impl<T> From<std::sync::PoisonError<T>> for SagaError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for SagaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SagaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
