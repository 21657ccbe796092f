//! Presets command - list the presets a configuration defines.
//!
//! Shows both the statically configured presets and the dynamic presets
//! that would be offered for the serial ports attached right now.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use rtklink::config::RtkConfig;
use rtklink::ports::{dynamic_preset_id, PortFilter, PortScanner, SerialPortScanner};
use rtklink::preset::RtkPreset;

use crate::error::CliError;

/// Arguments for the presets command.
#[derive(Debug, Args)]
pub struct PresetsArgs {
    /// Path to the JSON configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

/// List presets.
pub fn run(args: PresetsArgs) -> Result<(), CliError> {
    let config = match &args.config {
        Some(path) => RtkConfig::load_from(path)?,
        None => RtkConfig::default(),
    };
    let mut presets = config.static_presets();

    // Dynamic presets for the ports attached right now.
    let templates = config.serial_port_templates();
    if !templates.is_empty() {
        let filter = PortFilter::new(&config.exclusion_patterns());
        let distinguish = templates.len() > 1;
        for port in SerialPortScanner::new().scan() {
            if filter.excludes(&port) {
                continue;
            }
            for (index, template) in templates.iter().enumerate() {
                let id = dynamic_preset_id(&port.device, index);
                presets.push(Arc::new(RtkPreset::from_serial_port(
                    id,
                    &port,
                    template,
                    distinguish,
                )));
            }
        }
    }

    if args.json {
        let infos: Vec<_> = presets.iter().map(|preset| preset.describe()).collect();
        // Safe: PresetInfo contains only JSON-representable fields
        println!("{}", serde_json::to_string_pretty(&infos).unwrap());
        return Ok(());
    }

    if presets.is_empty() {
        println!("No presets.");
        return Ok(());
    }
    for preset in &presets {
        let info = preset.describe();
        let kind = if info.dynamic { "dynamic" } else { "static" };
        println!(
            "{:<20} {:<8} {:<28} {}",
            info.id,
            kind,
            info.title,
            info.sources.join(", ")
        );
    }
    Ok(())
}
