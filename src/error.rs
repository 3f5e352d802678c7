//! Error types for libtask
//!
//! This module provides error handling types used throughout the library.

use thiserror::Error;

/// Main error type for libtask operations
#[derive(Error, Debug)]
pub enum Error {
    /// A wake or change descriptor could not be created or used
    #[error("Wake descriptor failure: {reason}")]
    WakeError {
        /// Reason for the failure, including the OS error
        reason: String,
    },

    /// A scheduler thread could not be spawned
    #[error("Failed to spawn scheduler thread: {reason}")]
    SpawnError {
        /// Reason for the spawn failure
        reason: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {reason}")]
    ConfigError {
        /// What was wrong with the configuration
        reason: String,
    },

    /// Runtime error
    #[error("Runtime error: {reason}")]
    RuntimeError {
        /// Reason for the runtime error
        reason: String,
    },
}

impl Error {
    pub(crate) fn wake(what: &str, err: std::io::Error) -> Self {
        Error::WakeError {
            reason: format!("{}: {}", what, err),
        }
    }
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::ConfigError {
            reason: "threads must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration: threads must be positive"
        );

        let err = Error::wake("eventfd", std::io::Error::from_raw_os_error(libc::EMFILE));
        assert!(err.to_string().starts_with("Wake descriptor failure: eventfd: "));
    }
}
