//! Error types for object storage operations.

use thiserror::Error;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// E001: Archive bucket missing or unreachable at startup
    E001StorageUnavailable,
    /// E004: Configuration missing or invalid
    E004InvalidConfig,
    /// E005: Write operation failed
    E005WriteFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001StorageUnavailable => "E001",
            Self::E004InvalidConfig => "E004",
            Self::E005WriteFailure => "E005",
        }
    }
}

/// Errors raised by the storage layer
#[derive(Debug, Error)]
pub enum WriterError {
    /// Bucket (or fs root) cannot be reached
    #[error("[{code}] Storage unavailable: {message}")]
    StorageUnavailable { code: &'static str, message: String },

    /// Invalid configuration provided
    #[error("[{code}] Invalid configuration: {message}")]
    InvalidConfig { code: &'static str, message: String },

    /// Write operation failed
    #[error("[{code}] Write operation failed: {message}")]
    WriteFailure { code: &'static str, message: String },
}

impl WriterError {
    pub fn storage_unavailable(message: String) -> Self {
        Self::StorageUnavailable {
            code: ErrorCode::E001StorageUnavailable.as_str(),
            message,
        }
    }

    /// Create an invalid config error with error code
    pub fn invalid_config(message: String) -> Self {
        Self::InvalidConfig {
            code: ErrorCode::E004InvalidConfig.as_str(),
            message,
        }
    }

    /// Create a write failure error with error code
    pub fn write_failure(message: String) -> Self {
        Self::WriteFailure {
            code: ErrorCode::E005WriteFailure.as_str(),
            message,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StorageUnavailable { .. } => ErrorCode::E001StorageUnavailable,
            Self::InvalidConfig { .. } => ErrorCode::E004InvalidConfig,
            Self::WriteFailure { .. } => ErrorCode::E005WriteFailure,
        }
    }
}

/// Result type alias for WriterError
pub type Result<T> = std::result::Result<T, WriterError>;
