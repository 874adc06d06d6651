//! Error types for vmpool.

use std::path::PathBuf;

/// Result type alias for vmpool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Step of per-VM provisioning that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    /// Creating the private scratch directory.
    ScratchDir,
    /// Building the ISO image from a CD-ROM source directory.
    Iso,
    /// Allocating a scratch disk file.
    ScratchDisk,
    /// Writing the slot id to the caller's index file.
    IndexFile,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionStep::ScratchDir => write!(f, "scratch directory"),
            ProvisionStep::Iso => write!(f, "cdrom image"),
            ProvisionStep::ScratchDisk => write!(f, "scratch disk"),
            ProvisionStep::IndexFile => write!(f, "index file"),
        }
    }
}

/// Errors that can occur while managing the slot pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid request or configuration, reported before any slot is touched.
    #[error("failed to {operation}: {reason}")]
    Config { operation: String, reason: String },

    /// Configuration file could not be loaded.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Operation requires elevated privileges.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Pool Errors
    // =========================================================================
    /// Pool store or lock file does not exist yet.
    #[error("vm pool not initialized at {0} (run `vmpool genips`)")]
    PoolNotInitialized(PathBuf),

    /// Every slot is leased.
    #[error("no free vm slots available")]
    NoFreeSlots,

    /// No running record with this id.
    #[error("no running vm with id {0}")]
    NotRunning(u32),

    /// Record is not in the state the operation requires.
    #[error("vm {id} is {actual}, expected {expected}")]
    InvalidState {
        id: u32,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Per-VM resources could not be provisioned.
    #[error("failed to provision {step} for vm {id}: {reason}")]
    Provisioning {
        id: u32,
        step: ProvisionStep,
        reason: String,
    },

    /// Hypervisor process could not be started.
    #[error("failed to start hypervisor: {0}")]
    Spawn(String),

    /// A live hypervisor process did not terminate.
    #[error("failed to kill vm {id}: {reason}")]
    Kill { id: u32, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Pool store operation failed.
    #[error("storage error during {operation}: {reason}")]
    Storage { operation: String, reason: String },

    /// Lock file could not be acquired.
    #[error("failed to lock {path}: {reason}")]
    Lock { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a provisioning error.
    pub fn provisioning(id: u32, step: ProvisionStep, reason: impl Into<String>) -> Self {
        Error::Provisioning {
            id,
            step,
            reason: reason.into(),
        }
    }

    /// Create a kill error.
    pub fn kill(id: u32, reason: impl Into<String>) -> Self {
        Error::Kill {
            id,
            reason: reason.into(),
        }
    }
}
