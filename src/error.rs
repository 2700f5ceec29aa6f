//! Unified error types for nsfleet

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for nsfleet operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse TOML config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    ConfigJson(#[from] serde_json::Error),

    #[error("Failed to serialize TOML config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Privilege errors
    #[error("'{0}' requires root privileges")]
    NotPrivileged(String),

    // Command execution errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command '{command}' timed out after {secs} seconds")]
    CommandTimeout { command: String, secs: u64 },

    // Interface and namespace errors
    #[error("Failed to create {what}: {message}")]
    CreateFailed { what: String, message: String },

    #[error("Failed to delete {what}: {message}")]
    DeleteFailed { what: String, message: String },

    #[error("Physical uplink '{0}' does not exist")]
    InvalidUplink(String),

    #[error("'{0}' needs an OOB interface but no physical_int is configured")]
    MissingUplink(String),

    // Route errors
    #[error("Route '{route}' is invalid: {message}")]
    Validation { route: String, message: String },
}

/// Result type alias for nsfleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit statuses reported to the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Everything requested was done
    Success = 0,
    /// Configuration could not be loaded or validated
    ConfigError = 1,
    /// Invalid action or nothing to act on (clap usage errors also exit 2)
    NothingToDo = 2,
    /// A mutating action was requested without root
    NotPrivileged = 3,
    /// One or more namespace operations failed
    OperationsFailed = 4,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&Error> for ExitStatus {
    fn from(err: &Error) -> Self {
        match err {
            Error::ConfigRead { .. }
            | Error::ConfigParse(_)
            | Error::ConfigJson(_)
            | Error::ConfigSerialize(_)
            | Error::ConfigValidation(_) => ExitStatus::ConfigError,
            Error::NotPrivileged(_) => ExitStatus::NotPrivileged,
            _ => ExitStatus::OperationsFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            ExitStatus::Success.code(),
            ExitStatus::ConfigError.code(),
            ExitStatus::NothingToDo.code(),
            ExitStatus::NotPrivileged.code(),
            ExitStatus::OperationsFailed.code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
        assert_eq!(ExitStatus::Success.code(), 0);
    }

    #[test]
    fn test_exit_status_from_error() {
        let err = Error::NotPrivileged("create".to_string());
        assert_eq!(ExitStatus::from(&err), ExitStatus::NotPrivileged);

        let err = Error::ConfigValidation("bad".to_string());
        assert_eq!(ExitStatus::from(&err), ExitStatus::ConfigError);

        let err = Error::MissingUplink("left".to_string());
        assert_eq!(ExitStatus::from(&err), ExitStatus::OperationsFailed);
    }
}
