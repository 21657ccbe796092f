//! Service configuration.
//!
//! The configuration is a JSON document. Besides the statically declared
//! presets it controls dynamic serial port discovery (`add_serial_ports`
//! accepts a boolean, a bare baud rate or a list of templates) and the
//! exclusion list for ports that must never become presets.
//!
//! Parsing is tolerant where the document structure allows it: an invalid
//! preset entry or template is logged and skipped so one typo does not take
//! the whole service down.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::ports::SerialPortTemplate;
use crate::preset::{PresetSpec, RtkPreset, SharedPreset};

/// Errors from loading the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid JSON or has the wrong shape.
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// Document Shape
// ============================================================================

/// `add_serial_ports` accepts three shapes: a boolean switch, a single baud
/// rate, or a full template list. Anything else is kept as-is and reported
/// when the templates are requested, so one stray value does not fail the
/// whole configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "Value")]
pub enum AddSerialPorts {
    Enabled(bool),
    Baud(u32),
    Templates(Vec<Value>),
    Invalid(Value),
}

impl Default for AddSerialPorts {
    fn default() -> Self {
        AddSerialPorts::Enabled(false)
    }
}

impl From<Value> for AddSerialPorts {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => AddSerialPorts::Enabled(false),
            Value::Bool(enabled) => AddSerialPorts::Enabled(enabled),
            Value::Number(number) => match number.as_u64().and_then(|n| u32::try_from(n).ok()) {
                Some(baud) => AddSerialPorts::Baud(baud),
                None => AddSerialPorts::Invalid(Value::Number(number)),
            },
            Value::Array(entries) => AddSerialPorts::Templates(entries),
            other => AddSerialPorts::Invalid(other),
        }
    }
}

/// `exclude_serial_ports` accepts a single pattern or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExcludePatterns {
    One(String),
    Many(Vec<String>),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtkConfig {
    /// Template for connection registry names; `{}` is replaced with the
    /// preset ID.
    pub id_format: String,

    /// Statically configured presets, keyed by ID. Entries are validated
    /// lazily so a broken preset does not fail the whole configuration.
    pub presets: BTreeMap<String, Value>,

    /// Dynamic serial port discovery.
    pub add_serial_ports: AddSerialPorts,

    /// Glob patterns for serial devices that must not become presets.
    pub exclude_serial_ports: Option<ExcludePatterns>,

    /// Ask receivers for extra decimal digits in NMEA coordinates when
    /// configuring a survey.
    pub use_high_precision: bool,
}

impl Default for RtkConfig {
    fn default() -> Self {
        Self {
            id_format: "rtk:{}".to_string(),
            presets: BTreeMap::new(),
            add_serial_ports: AddSerialPorts::default(),
            exclude_serial_ports: None,
            use_high_precision: true,
        }
    }
}

impl RtkConfig {
    /// Parses a configuration from a JSON string.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses a configuration from an already-deserialized JSON value.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Loads a configuration from a JSON file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Builds the statically configured presets.
    ///
    /// Invalid entries are logged and skipped.
    pub fn static_presets(&self) -> Vec<SharedPreset> {
        let mut presets = Vec::new();
        for (id, raw) in &self.presets {
            let spec = match serde_json::from_value::<PresetSpec>(raw.clone()) {
                Ok(spec) => spec,
                Err(error) => {
                    warn!(id = %id, error = %error, "Ignoring invalid RTK preset configuration");
                    continue;
                }
            };
            match RtkPreset::from_spec(id, &spec) {
                Ok(preset) => presets.push(Arc::new(preset)),
                Err(error) => {
                    warn!(id = %id, error = %error, "Ignoring invalid RTK preset configuration");
                }
            }
        }
        presets
    }

    /// Templates for presets created from discovered serial ports. Empty
    /// when discovery is disabled.
    pub fn serial_port_templates(&self) -> Vec<SerialPortTemplate> {
        match &self.add_serial_ports {
            AddSerialPorts::Enabled(false) => Vec::new(),
            AddSerialPorts::Enabled(true) => vec![SerialPortTemplate::default()],
            AddSerialPorts::Baud(baud) => vec![SerialPortTemplate::with_baud(*baud)],
            AddSerialPorts::Templates(entries) => entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| match template_from_entry(entry) {
                    Ok(template) => Some(template),
                    Err(error) => {
                        warn!(index, error = %error, "Ignoring invalid serial port configuration");
                        None
                    }
                })
                .collect(),
            AddSerialPorts::Invalid(value) => {
                warn!(%value, "Ignoring invalid serial port configuration");
                Vec::new()
            }
        }
    }

    /// Exclusion patterns for serial port discovery.
    pub fn exclusion_patterns(&self) -> Vec<String> {
        match &self.exclude_serial_ports {
            None => Vec::new(),
            Some(ExcludePatterns::One(pattern)) => vec![pattern.clone()],
            Some(ExcludePatterns::Many(patterns)) => patterns.clone(),
        }
    }
}

/// A template list entry is either a bare baud rate or a template object.
fn template_from_entry(entry: &Value) -> Result<SerialPortTemplate, serde_json::Error> {
    match entry {
        Value::Number(_) => {
            let baud: u32 = serde_json::from_value(entry.clone())?;
            Ok(SerialPortTemplate::with_baud(baud))
        }
        _ => serde_json::from_value(entry.clone()),
    }
}
