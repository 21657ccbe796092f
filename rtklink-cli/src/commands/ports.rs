//! Ports command - list serial ports visible to the service.

use std::path::PathBuf;

use clap::Args;

use rtklink::config::RtkConfig;
use rtklink::ports::{PortFilter, PortScanner, SerialPortScanner};

use crate::error::CliError;

/// Arguments for the ports command.
#[derive(Debug, Args)]
pub struct PortsArgs {
    /// Path to the JSON configuration file; its exclusion patterns are
    /// applied to the listing
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// List serial ports, marking the ones the configuration excludes.
pub fn run(args: PortsArgs) -> Result<(), CliError> {
    let config = match &args.config {
        Some(path) => RtkConfig::load_from(path)?,
        None => RtkConfig::default(),
    };
    let filter = PortFilter::new(&config.exclusion_patterns());

    let ports = SerialPortScanner::new().scan();
    if ports.is_empty() {
        println!("No serial ports detected.");
        return Ok(());
    }
    for port in ports {
        let marker = if filter.excludes(&port) {
            "  (excluded)"
        } else {
            ""
        };
        println!("{:<24} {}{}", port.device, port.label, marker);
    }
    Ok(())
}
