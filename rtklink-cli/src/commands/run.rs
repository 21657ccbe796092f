//! Run command - start the correction service and wait for Ctrl+C.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tokio::time::MissedTickBehavior;
use tracing::info;

use rtklink::config::RtkConfig;
use rtklink::logging::{default_log_dir, default_log_file, init_logging};
use rtklink::service::RtkServiceBuilder;

use crate::error::CliError;

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the JSON configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Preset to activate immediately
    #[arg(long)]
    pub source: Option<String>,

    /// Seconds between serial port rescans; 0 disables rescanning
    #[arg(long, default_value = "5")]
    pub scan_interval: u64,

    /// Directory for log files
    #[arg(long, default_value_t = default_log_dir().to_string())]
    pub log_dir: String,
}

/// Run the service until interrupted.
pub async fn run(args: RunArgs) -> Result<(), CliError> {
    let _logging_guard = init_logging(&args.log_dir, default_log_file())?;

    let config = match &args.config {
        Some(path) => RtkConfig::load_from(path)?,
        None => RtkConfig::default(),
    };

    println!("RTKLink v{}", rtklink::VERSION);
    println!("================");
    println!();

    let (service, handle) = RtkServiceBuilder::new(config).start();

    let ids = handle.source_ids();
    if ids.is_empty() {
        println!("No presets offered yet; serial ports are added as they appear.");
    } else {
        println!("Presets: {}", ids.join(", "));
    }

    if let Some(source) = &args.source {
        handle.select_source(Some(source)).await?;
        println!("Activating preset '{}'", source);
    }

    // Serial hotplug has no portable notification mechanism; a periodic
    // rescan keeps dynamic presets current.
    let poller = (args.scan_interval > 0).then(|| {
        let handle = handle.clone();
        let token = service.shutdown_token();
        let period = Duration::from_secs(args.scan_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => handle.notify_hotplug(),
                }
            }
        })
    });

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    wait_for_shutdown_signal().await;

    println!();
    println!("Stopping...");
    service.shutdown().await;
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    println!("Stopped.");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        // Cannot install the handler; shut down now instead of running
        // unkillable.
        tracing::error!("Cannot listen for Ctrl+C: {}", error);
    }
    info!("Shutdown signal received");
}
