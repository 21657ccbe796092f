//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::process;

use rtklink::config::ConfigError;
use rtklink::service::ControlError;
use thiserror::Error;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug, Error)]
pub enum CliError {
    /// Failed to initialize logging.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A control operation on the running service failed.
    #[error("Service error: {0}")]
    Control(#[from] ControlError),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        // Print additional help for specific errors
        match self {
            CliError::Config(_) => {
                eprintln!();
                eprintln!("The configuration must be a JSON document, e.g.:");
                eprintln!(
                    "  {{\"presets\": {{\"base\": {{\"source\": \"serial:/dev/ttyUSB0\"}}}}}}"
                );
            }
            CliError::Control(ControlError::UnknownPreset(_)) => {
                eprintln!();
                eprintln!("Use 'rtklink presets' to list the available preset IDs.");
            }
            _ => {}
        }

        process::exit(1)
    }
}
