//! Error types for the enforcement system
//!
//! This module defines the various errors that can occur during enforcement operations.

use thiserror::Error;

/// Errors that can occur during enforcement operations
#[derive(Debug, Error)]
pub enum EnforcementError {
    /// Missing or unusable runtime setting (admin token, timezone)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bypass duration outside the allowed set
    #[error("Invalid bypass duration: {0} minutes (use 15, 30, 60, 120 or 240)")]
    InvalidBypassDuration(u32),

    /// User row not found
    #[error("User not found: {0}")]
    UserNotFound(u64),

    /// Rule row not found
    #[error("Rule not found: {0}")]
    RuleNotFound(u64),

    /// Transport failure or timeout talking to the remote account API
    #[error("Remote API error: {0}")]
    RemoteApi(#[from] reqwest::Error),

    /// Remote account API answered with a non-success status
    #[error("Remote API returned status {status} for account {account}")]
    RemoteStatus { status: u16, account: String },

    /// Reading or writing a data file failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic error
    #[error("Enforcement error: {0}")]
    Other(String),
}

impl From<std::io::Error> for EnforcementError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<serde_yaml::Error> for EnforcementError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Convert a string into an `EnforcementError`
impl From<String> for EnforcementError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for enforcement operations
pub type EnforcementResult<T> = Result<T, EnforcementError>;
