//! Correction source presets.
//!
//! A preset is an immutable description of where corrections come from and
//! how the stream is handled: an ID, a display title, one or more source
//! descriptors, a stream format and an auto-survey flag. Presets come from
//! two places: the static configuration, and dynamic discovery of serial
//! ports. Activation state lives entirely in the supervisor; switching
//! presets never mutates them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{ConnectionError, SourceSpec};
use crate::packet::{CodecStrategy, PacketEncoder, PacketParser, PresetFormat, RtkPacket};
use crate::ports::{PortInfo, SerialPortTemplate};

mod catalog;

pub use catalog::PresetCatalog;

// ============================================================================
// Preset
// ============================================================================

/// Immutable preset definition.
#[derive(Debug)]
pub struct RtkPreset {
    id: String,
    title: String,
    sources: Vec<SourceSpec>,
    format: PresetFormat,
    auto_survey: bool,
    dynamic: bool,
    strategy: &'static CodecStrategy,
}

impl RtkPreset {
    /// Creates a static preset.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        sources: Vec<SourceSpec>,
        format: PresetFormat,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            sources,
            format,
            auto_survey: false,
            dynamic: false,
            strategy: CodecStrategy::for_format(format),
        }
    }

    /// Enables starting a survey automatically when the preset activates.
    pub fn with_auto_survey(mut self, auto_survey: bool) -> Self {
        self.auto_survey = auto_survey;
        self
    }

    /// Builds a preset from a configuration entry.
    pub fn from_spec(id: &str, spec: &PresetSpec) -> Result<Self, PresetError> {
        let mut sources = Vec::new();
        for descriptor in spec.sources.iter() {
            sources.push(SourceSpec::parse(descriptor)?);
        }
        if sources.is_empty() {
            return Err(PresetError::NoSources);
        }
        let title = spec.title.clone().unwrap_or_else(|| id.to_string());
        Ok(Self::new(id, title, sources, spec.format).with_auto_survey(spec.auto_survey))
    }

    /// Builds a dynamic preset for a discovered serial port.
    ///
    /// `distinguish_title` appends the baud rate to the title; used when
    /// several templates produce presets for the same physical port.
    pub fn from_serial_port(
        id: impl Into<String>,
        port: &PortInfo,
        template: &SerialPortTemplate,
        distinguish_title: bool,
    ) -> Self {
        let title = if distinguish_title {
            format!("{} ({} baud)", port.label, template.baud)
        } else {
            port.label.clone()
        };
        let mut preset = Self::new(
            id,
            title,
            vec![SourceSpec::serial(port.device.clone(), template.baud)],
            template.format,
        )
        .with_auto_survey(template.auto_survey);
        preset.dynamic = true;
        preset
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn sources(&self) -> &[SourceSpec] {
        &self.sources
    }

    pub fn format(&self) -> PresetFormat {
        self.format
    }

    pub fn auto_survey(&self) -> bool {
        self.auto_survey
    }

    /// True for presets created by serial port discovery.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Whether this preset's sources accept survey-in configuration.
    pub fn survey_capable(&self) -> bool {
        self.strategy.survey_capable()
    }

    /// Fresh parser for one source connection.
    pub fn create_parser(&self) -> Box<dyn PacketParser> {
        self.strategy.new_parser()
    }

    /// Encoder for packets forwarded from this preset.
    pub fn create_encoder(&self) -> Box<dyn PacketEncoder> {
        self.strategy.new_encoder()
    }

    /// Returns true if the packet should be forwarded to subscribers.
    pub fn accepts(&self, packet: &RtkPacket) -> bool {
        self.strategy.accepts(packet)
    }

    /// Public description, as served to clients.
    pub fn describe(&self) -> PresetInfo {
        PresetInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            format: self.format,
            sources: self.sources.iter().map(|s| s.to_string()).collect(),
            auto_survey: self.auto_survey,
            dynamic: self.dynamic,
        }
    }
}

/// Serializable description of a preset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresetInfo {
    pub id: String,
    pub title: String,
    pub format: PresetFormat,
    pub sources: Vec<String>,
    pub auto_survey: bool,
    pub dynamic: bool,
}

// ============================================================================
// Configuration Shape
// ============================================================================

/// One preset entry as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresetSpec {
    /// Display title; defaults to the preset ID.
    #[serde(default)]
    pub title: Option<String>,

    /// Stream format; defaults to `auto`.
    #[serde(default)]
    pub format: PresetFormat,

    /// Source descriptor(s); a single string or a list.
    #[serde(default, alias = "source")]
    pub sources: SourceList,

    /// Start a survey automatically on activation.
    #[serde(default)]
    pub auto_survey: bool,
}

/// A single source descriptor or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceList {
    One(String),
    Many(Vec<String>),
}

impl Default for SourceList {
    fn default() -> Self {
        SourceList::Many(Vec::new())
    }
}

impl SourceList {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            SourceList::One(descriptor) => std::slice::from_ref(descriptor),
            SourceList::Many(descriptors) => descriptors.as_slice(),
        }
        .iter()
        .map(String::as_str)
    }
}

/// Errors from building a preset out of configuration.
#[derive(Debug, Error)]
pub enum PresetError {
    /// A preset must name at least one source.
    #[error("preset has no sources")]
    NoSources,

    /// A source descriptor could not be parsed.
    #[error("invalid source: {0}")]
    Source(#[from] ConnectionError),
}

/// Shared handle type used throughout the service.
pub type SharedPreset = Arc<RtkPreset>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spec_single_source() {
        let spec: PresetSpec = serde_json::from_str(
            r#"{"title": "Base station", "source": "serial:/dev/ttyUSB0?baud=57600"}"#,
        )
        .unwrap();
        let preset = RtkPreset::from_spec("base", &spec).unwrap();
        assert_eq!(preset.id(), "base");
        assert_eq!(preset.title(), "Base station");
        assert_eq!(preset.format(), PresetFormat::Auto);
        assert_eq!(preset.sources(), &[SourceSpec::serial("/dev/ttyUSB0", 57600)]);
        assert!(!preset.is_dynamic());
        assert!(!preset.auto_survey());
    }

    #[test]
    fn test_from_spec_multiple_sources_keep_order() {
        let spec: PresetSpec = serde_json::from_str(
            r#"{"sources": ["tcp:rtk.example.com:2101", "serial:/dev/ttyUSB1"], "format": "ubx"}"#,
        )
        .unwrap();
        let preset = RtkPreset::from_spec("dual", &spec).unwrap();
        assert_eq!(preset.title(), "dual");
        assert_eq!(
            preset.sources(),
            &[
                SourceSpec::tcp("rtk.example.com", 2101),
                SourceSpec::serial("/dev/ttyUSB1", crate::ports::DEFAULT_BAUD),
            ]
        );
        assert!(preset.survey_capable());
    }

    #[test]
    fn test_from_spec_rejects_empty_sources() {
        let spec: PresetSpec = serde_json::from_str(r#"{"title": "empty"}"#).unwrap();
        assert!(matches!(
            RtkPreset::from_spec("empty", &spec),
            Err(PresetError::NoSources)
        ));
    }

    #[test]
    fn test_from_spec_rejects_bad_descriptor() {
        let spec: PresetSpec =
            serde_json::from_str(r#"{"source": "carrier-pigeon:coop"}"#).unwrap();
        assert!(matches!(
            RtkPreset::from_spec("bad", &spec),
            Err(PresetError::Source(_))
        ));
    }

    #[test]
    fn test_from_serial_port() {
        let port = PortInfo::new("/dev/ttyUSB0", "u-blox GNSS receiver");
        let template = SerialPortTemplate::with_baud(57600);
        let preset = RtkPreset::from_serial_port("dev-ttyUSB0-0", &port, &template, false);
        assert_eq!(preset.title(), "u-blox GNSS receiver");
        assert!(preset.is_dynamic());
        assert_eq!(
            preset.sources(),
            &[SourceSpec::serial("/dev/ttyUSB0", 57600)]
        );
    }

    #[test]
    fn test_from_serial_port_distinguished_title() {
        let port = PortInfo::new("/dev/ttyUSB0", "u-blox GNSS receiver");
        let template = SerialPortTemplate::with_baud(9600);
        let preset = RtkPreset::from_serial_port("dev-ttyUSB0-1", &port, &template, true);
        assert_eq!(preset.title(), "u-blox GNSS receiver (9600 baud)");
    }

    #[test]
    fn test_other_format_is_not_survey_capable() {
        let preset = RtkPreset::new(
            "opaque",
            "Opaque",
            vec![SourceSpec::tcp("localhost", 9000)],
            PresetFormat::Other,
        );
        assert!(!preset.survey_capable());
    }

    #[test]
    fn test_describe_serializes_cleanly() {
        let preset = RtkPreset::new(
            "base",
            "Base",
            vec![SourceSpec::serial("/dev/ttyUSB0", 115_200)],
            PresetFormat::Auto,
        )
        .with_auto_survey(true);
        let info = preset.describe();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], "base");
        assert_eq!(json["format"], "auto");
        assert_eq!(json["auto_survey"], true);
        assert_eq!(json["sources"][0], "serial:/dev/ttyUSB0?baud=115200");
    }
}
