use thiserror::Error;

/// Error produced when a `host:port` endpoint cannot be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostPortError {
    #[error("missing ':' separator in endpoint '{0}'")]
    MissingSeparator(String),

    #[error("empty host in endpoint '{0}'")]
    EmptyHost(String),

    #[error("invalid port in endpoint '{0}'")]
    InvalidPort(String),
}

/// Core error types for unitd supervision
#[derive(Error, Debug)]
pub enum UnitdError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] HostPortError),

    #[error("Cannot resolve {kind} '{value}': {reason}")]
    IdentityResolution {
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Readiness check failed: {0}")]
    ReadinessFailed(String),

    #[error("Process exited during startup: {0}")]
    ExitedDuringStartup(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Signal {0} is already watched by another component")]
    SignalBusy(String),

    #[error("Signal handling error: {0}")]
    SignalError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UnitdError {
    pub fn configuration(message: impl Into<String>) -> Self {
        UnitdError::ConfigurationError(message.into())
    }

    pub fn spawn_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        UnitdError::SpawnFailed {
            command: command.into(),
            source,
        }
    }

    pub fn handshake(message: impl Into<String>) -> Self {
        UnitdError::HandshakeFailed(message.into())
    }

    /// Errors caused by the operator's environment or input rather than by a
    /// fault in the supervisor. These are reported with exit code 1.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            UnitdError::ConfigurationError(_)
                | UnitdError::InvalidEndpoint(_)
                | UnitdError::IdentityResolution { .. }
                | UnitdError::HandshakeFailed(_)
        )
    }

    /// Errors that move a process from `Starting`/`Confirming` into `Failed`
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            UnitdError::SpawnFailed { .. }
                | UnitdError::CommandFailed(_)
                | UnitdError::ReadinessFailed(_)
                | UnitdError::ExitedDuringStartup(_)
                | UnitdError::Timeout(_)
                | UnitdError::IdentityResolution { .. }
                | UnitdError::Cancelled
        )
    }
}
