//! Serial port enumeration and filtering.
//!
//! Dynamic preset discovery needs to know which serial ports exist right now.
//! The [`PortScanner`] trait abstracts the enumeration so the reconciler can
//! be driven by a fake scanner in tests; [`SerialPortScanner`] is the real
//! implementation backed by the operating system.

use glob::Pattern;
use serde::Deserialize;
use tracing::warn;

use crate::packet::PresetFormat;

/// Standard baud rate of 433 MHz telemetry radios.
pub const DEFAULT_BAUD: u32 = 115_200;

// ============================================================================
// Port Description
// ============================================================================

/// A serial port as seen by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub device: String,
    /// Human-readable label, typically the USB product string.
    pub label: String,
}

impl PortInfo {
    pub fn new(device: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            label: label.into(),
        }
    }
}

/// Enumerates serial ports currently attached to the system.
pub trait PortScanner: Send + Sync {
    /// Returns all visible serial ports, sorted by device path.
    fn scan(&self) -> Vec<PortInfo>;
}

/// Production scanner backed by the operating system's port list.
#[derive(Debug, Default, Clone)]
pub struct SerialPortScanner;

impl SerialPortScanner {
    pub fn new() -> Self {
        Self
    }
}

impl PortScanner for SerialPortScanner {
    fn scan(&self) -> Vec<PortInfo> {
        let mut ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(error) => {
                warn!(error = %error, "Failed to enumerate serial ports");
                return Vec::new();
            }
        };
        ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        ports
            .into_iter()
            .map(|port| {
                let label = match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => usb
                        .product
                        .clone()
                        .or_else(|| usb.manufacturer.clone())
                        .unwrap_or_else(|| port.port_name.clone()),
                    _ => port.port_name.clone(),
                };
                PortInfo::new(port.port_name, label)
            })
            .collect()
    }
}

// ============================================================================
// Exclusion Filter
// ============================================================================

/// Glob-based exclusion list for serial devices.
///
/// Patterns match against the device path or the human-readable label, so
/// operators can exclude by name ("*Bluetooth*") as well as by path.
/// Invalid patterns are logged and skipped rather than failing the whole
/// filter, so one typo in the configuration does not disable port discovery.
#[derive(Debug, Default)]
pub struct PortFilter {
    patterns: Vec<Pattern>,
}

impl PortFilter {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(error) => {
                    warn!(pattern = %raw, error = %error, "Ignoring invalid exclusion pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if the device path or label matches any exclusion pattern.
    pub fn excludes(&self, port: &PortInfo) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches(&port.device) || pattern.matches(&port.label))
    }
}

// ============================================================================
// Dynamic Preset Templates
// ============================================================================

/// Connection parameters applied to every discovered serial port.
///
/// A configuration may carry several templates; each detected port then
/// yields one preset per template.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SerialPortTemplate {
    /// Baud rate for the connection.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Stream format of presets created from this template.
    #[serde(default)]
    pub format: PresetFormat,

    /// Whether presets created from this template start a survey when
    /// activated.
    #[serde(default)]
    pub auto_survey: bool,
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

impl Default for SerialPortTemplate {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            format: PresetFormat::default(),
            auto_survey: false,
        }
    }
}

impl SerialPortTemplate {
    pub fn with_baud(baud: u32) -> Self {
        Self {
            baud,
            ..Self::default()
        }
    }
}

/// Deterministic preset ID for a serial port and template index.
///
/// The ID is a pure function of the device path and the template position, so
/// a replugged device maps back to the same preset ID. Characters outside
/// `[A-Za-z0-9._:-]` are replaced with dashes and leading dashes stripped.
pub fn dynamic_preset_id(device: &str, template_index: usize) -> String {
    let raw = format!("{}/{}", device, template_index);
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.trim_matches('-').to_string()
}
