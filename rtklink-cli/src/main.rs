//! RTKLink CLI - Command-line interface
//!
//! This binary provides a command-line frontend to the rtklink library.

use clap::{Parser, Subcommand};

mod commands;
mod error;

#[derive(Parser)]
#[command(name = "rtklink")]
#[command(about = "Stream RTK corrections from base stations to a drone fleet", long_about = None)]
#[command(version = rtklink::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the correction service until interrupted
    Run(commands::run::RunArgs),
    /// List serial ports visible to the service
    Ports(commands::ports::PortsArgs),
    /// List the presets a configuration defines
    Presets(commands::presets::PresetsArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => commands::run::run(args).await,
        Command::Ports(args) => commands::ports::run(args),
        Command::Presets(args) => commands::presets::run(args),
    };
    if let Err(error) = result {
        error.exit();
    }
}
