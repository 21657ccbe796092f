//! CLI command implementations.
//!
//! Each subcommand has its own module with argument definitions and a
//! handler.
//!
//! # Command Modules
//!
//! - [`ports`] - List serial ports visible to the service
//! - [`presets`] - List the presets a configuration defines
//! - [`run`] - Run the correction service until interrupted

pub mod ports;
pub mod presets;
pub mod run;
