//! Error types and the failure taxonomy used to pick recovery strategies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Contract violations surfaced directly to library callers.
///
/// Everything else (applier failures, failed recoveries) is reported through
/// structured outcomes instead of `Err`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Unit id must not be empty")]
    EmptyUnitId,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Audit chain broken at entry {sequence}")]
    AuditChainBroken { sequence: u64 },
}

/// Result alias for engine operations that can violate a contract.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by an [`UpdateApplier`](crate::ports::UpdateApplier).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplierError {
    #[error("Unit not loaded: {unit_id}")]
    UnitNotFound { unit_id: String },

    #[error("Runtime rejected the redefinition: {0}")]
    Rejected(String),

    #[error("Instance state update failed: {0}")]
    InstanceState(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Operation not permitted: {0}")]
    PermissionDenied(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

/// Errors reported by a [`CompatibilityValidator`](crate::ports::CompatibilityValidator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Incompatible change: {0}")]
    Incompatible(String),

    #[error("Malformed implementation: {0}")]
    Malformed(String),
}

/// Errors reported by a [`RuntimeControl`](crate::ports::RuntimeControl) action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("Runtime action failed: {0}")]
    Failed(String),

    #[error("Runtime action not supported: {0}")]
    Unsupported(String),
}

/// Classification of failures reported to the recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The candidate implementation failed compatibility validation
    ValidationError,
    /// The runtime refused or failed to apply the redefinition
    RedefinitionFailure,
    /// Live instances could not be migrated to the new implementation
    InstanceUpdateError,
    /// Process-level failure (out of memory, stack exhaustion)
    CriticalSystemError,
    /// Permission or policy violation
    SecurityError,
    /// Missing or unreadable implementation files
    FileSystemError,
    /// Invalid engine or runtime configuration
    ConfigurationError,
    /// Transient transport failure
    NetworkError,
    /// Resource exhaustion short of a process crash
    ResourceError,
    /// Anything the classifier does not recognise
    UnknownError,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::ValidationError,
        Self::RedefinitionFailure,
        Self::InstanceUpdateError,
        Self::CriticalSystemError,
        Self::SecurityError,
        Self::FileSystemError,
        Self::ConfigurationError,
        Self::NetworkError,
        Self::ResourceError,
        Self::UnknownError,
    ];

    /// Short name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation",
            Self::RedefinitionFailure => "redefinition",
            Self::InstanceUpdateError => "instance-update",
            Self::CriticalSystemError => "critical",
            Self::SecurityError => "security",
            Self::FileSystemError => "filesystem",
            Self::ConfigurationError => "configuration",
            Self::NetworkError => "network",
            Self::ResourceError => "resource",
            Self::UnknownError => "unknown",
        }
    }

    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::CriticalSystemError | Self::SecurityError)
    }

    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        !matches!(self, Self::CriticalSystemError)
    }

    #[must_use]
    pub const fn requires_immediate_attention(self) -> bool {
        matches!(
            self,
            Self::CriticalSystemError | Self::SecurityError | Self::ResourceError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ApplierError> for ErrorKind {
    fn from(err: &ApplierError) -> Self {
        match err {
            ApplierError::UnitNotFound { .. } | ApplierError::Rejected(_) => {
                Self::RedefinitionFailure
            }
            ApplierError::InstanceState(_) => Self::InstanceUpdateError,
            ApplierError::Io(_) => Self::FileSystemError,
            ApplierError::Transport(_) => Self::NetworkError,
            ApplierError::ResourceExhausted(_) => Self::ResourceError,
            ApplierError::PermissionDenied(_) => Self::SecurityError,
            ApplierError::Configuration(_) => Self::ConfigurationError,
            ApplierError::Other(_) => Self::UnknownError,
        }
    }
}

impl From<&ValidationError> for ErrorKind {
    fn from(_: &ValidationError) -> Self {
        Self::ValidationError
    }
}
