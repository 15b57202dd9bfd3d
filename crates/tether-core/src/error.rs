use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceWorkerError {
    /// Shutdown, cancellation, or a store disabled by an earlier failure.
    #[error("operation aborted")]
    Aborted,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("failed to start worker")]
    StartWorkerFailed,

    #[error("install event failed")]
    InstallFailed,

    #[error("activate event failed")]
    ActivateFailed,

    #[error("event was rejected by the worker")]
    EventRejected,

    #[error("worker ipc failed")]
    IpcFailed,

    #[error("timed out")]
    Timeout,

    #[error("disallowed: {0}")]
    Disallowed(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage io error: {0}")]
    Io(String),

    #[error("storage corrupted: {0}")]
    Corrupted(String),
}

impl ServiceWorkerError {
    /// Errors that come from the storage layer and disable the store.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Corrupted(_))
    }

    /// Stable lowercase code for logs and listings.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::StartWorkerFailed => "start_worker_failed",
            Self::InstallFailed => "install_failed",
            Self::ActivateFailed => "activate_failed",
            Self::EventRejected => "event_rejected",
            Self::IpcFailed => "ipc_failed",
            Self::Timeout => "timeout",
            Self::Disallowed(_) => "disallowed",
            Self::InvalidState(_) => "invalid_state",
            Self::Io(_) => "io_error",
            Self::Corrupted(_) => "corrupted",
        }
    }
}

pub type ServiceWorkerResult<T> = std::result::Result<T, ServiceWorkerError>;
