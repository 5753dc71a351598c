//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Failed to build the async runtime
    Runtime(std::io::Error),
    /// More factory bodies ran than computations were claimed
    DuplicateWork { expected: u64, actual: u64 },
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::DuplicateWork { .. } = self {
            eprintln!();
            eprintln!("Factories supplied by joining callers were executed.");
            eprintln!("Re-run with --debug to see registration and settlement events.");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::DuplicateWork { expected, actual } => write!(
                f,
                "Claimed {} computations but observed {} factory runs",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = CliError::InvalidArgs("--callers must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid arguments: --callers must be at least 1"
        );

        let err = CliError::DuplicateWork {
            expected: 2,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "Claimed 2 computations but observed 5 factory runs"
        );
    }

    #[test]
    fn test_runtime_error_has_source() {
        use std::error::Error;

        let err = CliError::Runtime(std::io::Error::other("no threads"));
        assert!(err.source().is_some());
        assert!(CliError::LoggingInit("x".to_string()).source().is_none());
    }
}
