//! Unified error handling for graphforge
//!
//! Every fallible runtime operation returns [`ForgeResult`]. Errors are
//! categorized so callers can decide between retrying, reporting a bug, or
//! blaming the device:
//! - User errors (bad configuration)
//! - Recoverable errors (pool exhaustion, device hiccups)
//! - Internal errors (bugs, poisoned locks)
//! - Backend errors (device/stream failures)
//!
//! Consistency violations (a kernel reading a buffer its producer never
//! allocated) are not represented here. They panic, because they mean the
//! graph handed to the runtime is broken.

use std::fmt;

use crate::graph::GraphId;

/// Unified error type for graphforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Memory Errors ==========
    /// The pool arena cannot satisfy an allocation
    #[error("Out of device memory: requested {requested} bytes, {available} bytes free")]
    OutOfMemory { requested: usize, available: usize },

    /// A pointer was returned to the pool that it never handed out
    #[error("Invalid free: {0}")]
    InvalidFree(String),

    // ========== Execution Errors ==========
    /// A kernel reported failure from its launch
    #[error("Kernel launch failed for '{kernel}': {reason}")]
    KernelLaunchFailed { kernel: String, reason: String },

    /// The end-of-run stream barrier failed
    #[error("Device stream synchronization failed: {0}")]
    DeviceSyncFailed(String),

    /// `run` was called on a graph that never went through `assign_memory`
    #[error("Graph {0} has no memory assignment")]
    GraphNotAssigned(GraphId),

    /// A different graph with the same id is already assigned in this session
    #[error("Graph id {0} is already assigned to a different graph")]
    GraphIdConflict(GraphId),

    // ========== Device Errors ==========
    /// No accelerator is visible
    #[error("No device found")]
    DeviceNotFound,

    /// Device selection or stream creation failed
    #[error("Device initialization failed: {0}")]
    DeviceInitFailed(String),

    /// An operation that needs the device ran before `init_device`
    #[error("Device not initialized")]
    DeviceNotInitialized,

    // ========== Configuration Errors ==========
    /// Invalid runtime configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Lock poisoned (a thread panicked while holding pool state)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::InvalidConfiguration(_)
            | ForgeError::GraphNotAssigned(_)
            | ForgeError::GraphIdConflict(_) => ErrorCategory::User,

            ForgeError::OutOfMemory { .. } | ForgeError::DeviceNotInitialized => {
                ErrorCategory::Recoverable
            }

            ForgeError::InvalidFree(_) | ForgeError::LockPoisoned(_) => ErrorCategory::Internal,

            ForgeError::KernelLaunchFailed { .. }
            | ForgeError::DeviceSyncFailed(_)
            | ForgeError::DeviceNotFound
            | ForgeError::DeviceInitFailed(_) => ErrorCategory::Backend,
        }
    }

    /// Check if a caller-level retry policy may retry after this error
    ///
    /// The runtime itself never retries; see the crate docs.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input or configuration
    User,
    /// Recoverable error - temporary condition
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
    /// Backend error - device/stream failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create a device initialization error with context
///
/// # Examples
/// ```ignore
/// return Err(backend_error!("device {} out of range", id));
/// ```
#[macro_export]
macro_rules! backend_error {
    ($msg:expr) => {
        $crate::error::ForgeError::DeviceInitFailed($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::DeviceInitFailed(format!($fmt, $($arg)*))
    };
}
