//! Error types for device control with rich context

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid session: {message}")]
    InvalidSession { message: String },

    #[error("A session is already active for device: {device_id}")]
    SessionAlreadyActive { device_id: String },

    // ─────────────────────────────────────────────────────────────
    // Device/Lock Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device {device_id} is locked by process {pid}")]
    DeviceLocked { device_id: String, pid: u32 },

    #[error("Device {device_id} is not booted")]
    DeviceNotBooted { device_id: String },

    #[error("Device {device_id} is busy booting; try again later")]
    DeviceNotReady { device_id: String },

    #[error("Device {device_id} is already booted")]
    DeviceAlreadyBooted { device_id: String },

    #[error("Illegal device state transition: {event} while {state}")]
    IllegalTransition { state: String, event: String },

    #[error("Device {device_id} did not finish booting within {waited_secs}s")]
    BootTimeout { device_id: String, waited_secs: u64 },

    #[error("Failed to launch application: {message}")]
    LaunchFailed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Driver Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid driver: {message}")]
    DriverInvalid { message: String },

    #[error("Discovery error: {message}")]
    Discovery { message: String },

    // ─────────────────────────────────────────────────────────────
    // Subprocess Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to spawn process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Command `{command}` exited with code {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Process error: {message}")]
    Process { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration/Argument Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid argument: {message}")]
    Argument { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn invalid_session(message: impl Into<String>) -> Self {
        Self::InvalidSession {
            message: message.into(),
        }
    }

    pub fn session_already_active(device_id: impl Into<String>) -> Self {
        Self::SessionAlreadyActive {
            device_id: device_id.into(),
        }
    }

    pub fn device_locked(device_id: impl Into<String>, pid: u32) -> Self {
        Self::DeviceLocked {
            device_id: device_id.into(),
            pid,
        }
    }

    pub fn not_booted(device_id: impl Into<String>) -> Self {
        Self::DeviceNotBooted {
            device_id: device_id.into(),
        }
    }

    pub fn not_ready(device_id: impl Into<String>) -> Self {
        Self::DeviceNotReady {
            device_id: device_id.into(),
        }
    }

    pub fn already_booted(device_id: impl Into<String>) -> Self {
        Self::DeviceAlreadyBooted {
            device_id: device_id.into(),
        }
    }

    pub fn illegal_transition(state: impl Into<String>, event: impl Into<String>) -> Self {
        Self::IllegalTransition {
            state: state.into(),
            event: event.into(),
        }
    }

    pub fn boot_timeout(device_id: impl Into<String>, waited_secs: u64) -> Self {
        Self::BootTimeout {
            device_id: device_id.into(),
            waited_secs,
        }
    }

    pub fn launch_failed(message: impl Into<String>) -> Self {
        Self::LaunchFailed {
            message: message.into(),
        }
    }

    pub fn driver_invalid(message: impl Into<String>) -> Self {
        Self::DriverInvalid {
            message: message.into(),
        }
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    pub fn non_zero_exit(
        command: impl Into<String>,
        code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::NonZeroExit {
            command: command.into(),
            code,
            stderr: stderr.into(),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors leave the device record intact; callers may retry
    /// once the underlying condition clears.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotReady { .. }
                | Error::DeviceLocked { .. }
                | Error::SessionAlreadyActive { .. }
                | Error::Discovery { .. }
                | Error::Process { .. }
        )
    }

    /// Check if this error should abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DriverInvalid { .. } | Error::ConfigNotFound { .. } | Error::Config { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
