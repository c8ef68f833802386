//! Error types for the EOL test station
//!
//! Every failure in the system is an [`EolError`]. Each variant belongs to
//! exactly one [`ErrorClass`], which decides how the layers above react:
//! drivers retry `Transient`, the sequence state machine aborts or faults on
//! `Protocol`/`Fatal`, and `Unsupported` is reported as a typed result.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classification shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout or busy; retryable
    Transient,
    /// Malformed or unexpected response; fatal to the current operation
    Protocol,
    /// Explicit device alarm or unrecoverable failure
    Fatal,
    /// Capability not available in the current (reduced) mode
    Unsupported,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for EOL station operations
#[derive(Error, Debug)]
pub enum EolError {
    /// Read, write or command exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Device reported it cannot accept the command right now
    #[error("Device busy: {0}")]
    Busy(String),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// TCP session errors
    #[error("Network error: {0}")]
    Network(String),

    /// Connection could not be established within the retry budget
    #[error("Connection to {target} failed after {attempts} attempts: {reason}")]
    ConnectionFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// Device disconnected (cable pulled, power cycle, peer closed)
    #[error("Device disconnected: {0}")]
    DeviceDisconnected(String),

    /// Capability invoked on a device that is not connected
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Malformed frame or unexpected response content
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame integrity check failed
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Response carried a different number of fields than the command implies
    #[error("Unexpected token count: expected {expected}, got {actual}")]
    UnexpectedTokenCount { expected: usize, actual: usize },

    /// Explicit device alarm or vendor return code
    #[error("Device fault {code}: {message}")]
    DeviceFault { code: i32, message: String },

    /// Capability unavailable (missing entry point, device family without it)
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Invalid input or arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required device missing from the device table
    #[error("Device not configured: {0}")]
    DeviceNotConfigured(String),

    /// Operation was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// Sequence phase exceeded its configured timeout
    #[error("Phase {phase} timed out after {timeout_ms} ms")]
    PhaseTimeout { phase: String, timeout_ms: u64 },

    /// Emergency stop is latched; operations are refused until reset
    #[error("Emergency stop active")]
    EmergencyStopActive,

    /// Engine is not running or already shut down
    #[error("Execution engine stopped")]
    EngineStopped,

    /// A task panicked while running on the worker
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for EOL station operations
pub type Result<T> = std::result::Result<T, EolError>;

impl EolError {
    /// Classification of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            EolError::Timeout(_) | EolError::Busy(_) => ErrorClass::Transient,
            EolError::Protocol(_)
            | EolError::ChecksumMismatch { .. }
            | EolError::UnexpectedTokenCount { .. } => ErrorClass::Protocol,
            EolError::Unsupported(_) => ErrorClass::Unsupported,
            _ => ErrorClass::Fatal,
        }
    }

    /// Stable numeric code. Device faults keep the vendor's own code.
    pub fn code(&self) -> i32 {
        match self {
            EolError::Timeout(_) => 100,
            EolError::Busy(_) => 101,
            EolError::Serial(_) => 200,
            EolError::Network(_) => 201,
            EolError::ConnectionFailed { .. } => 202,
            EolError::DeviceDisconnected(_) => 203,
            EolError::NotConnected(_) => 204,
            EolError::Protocol(_) => 300,
            EolError::ChecksumMismatch { .. } => 301,
            EolError::UnexpectedTokenCount { .. } => 302,
            EolError::DeviceFault { code, .. } => *code,
            EolError::Unsupported(_) => 400,
            EolError::InvalidInput(_) => 500,
            EolError::Config(_) => 501,
            EolError::DeviceNotConfigured(_) => 502,
            EolError::Cancelled => 600,
            EolError::PhaseTimeout { .. } => 601,
            EolError::EmergencyStopActive => 602,
            EolError::EngineStopped => 603,
            EolError::Panicked(_) => 604,
            EolError::Io(_) => 700,
            EolError::Serialization(_) => 701,
            EolError::Other(_) => 999,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this error should move the owning device handle to Faulted.
    ///
    /// Protocol and Unsupported errors are fatal to the operation only; the
    /// session itself is still usable.
    pub fn faults_device(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Fatal)
            && !matches!(
                self,
                EolError::Cancelled | EolError::InvalidInput(_) | EolError::NotConnected(_)
            )
    }

    /// Uniform record for reporting across layer boundaries
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            code: self.code(),
            message: self.to_string(),
            classification: self.class(),
        }
    }
}

impl From<serde_json::Error> for EolError {
    fn from(err: serde_json::Error) -> Self {
        EolError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EolError {
    fn from(err: toml::de::Error) -> Self {
        EolError::Config(err.to_string())
    }
}

/// Serializable error shape delivered to event subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: i32,
    pub message: String,
    pub classification: ErrorClass,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] {}", self.classification, self.code, self.message)
    }
}

impl From<&EolError> for ErrorRecord {
    fn from(err: &EolError) -> Self {
        err.to_record()
    }
}

impl From<EolError> for ErrorRecord {
    fn from(err: EolError) -> Self {
        err.to_record()
    }
}
