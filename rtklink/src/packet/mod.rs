//! Packet framing and classification for RTK correction streams.
//!
//! Correction sources emit an interleaved byte stream that may contain RTCM3
//! frames, UBX frames and NMEA sentences. This module splits that stream into
//! discrete packets, classifies them, and decides which packets are forwarded
//! to subscribers based on the preset format.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   raw bytes   ┌──────────────┐   RtkPacket   ┌──────────────┐
//! │  Connection   │ ────────────► │ PacketParser │ ────────────► │   accept()   │
//! │  (serial/tcp)│               │ (per source) │               │ + encoder    │
//! └──────────────┘               └──────────────┘               └──────────────┘
//! ```
//!
//! Each preset format maps to a [`CodecStrategy`]:
//!
//! - `auto` and `ubx` use the framing parser and forward RTCM and UBX packets
//!   only (NMEA chatter and unrecognized bytes are counted but dropped).
//! - `other` treats the stream as opaque chunks and forwards everything.
//!
//! # Example
//!
//! ```ignore
//! use rtklink::packet::{CodecStrategy, PresetFormat};
//!
//! let strategy = CodecStrategy::for_format(PresetFormat::Auto);
//! let mut parser = strategy.new_parser();
//! for packet in parser.push(&chunk) {
//!     if strategy.accepts(&packet) {
//!         // forward to subscribers
//!     }
//! }
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod parser;

pub use parser::FrameParser;
pub(crate) use parser::ubx_frame;

// ============================================================================
// Packet Types
// ============================================================================

/// Classification of a single packet cut from a correction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// RTCM3 correction frame.
    Rtcm,
    /// UBX protocol frame.
    Ubx,
    /// NMEA 0183 sentence.
    Nmea,
    /// Bytes that did not match any known framing.
    Unknown,
}

impl PacketKind {
    /// Short lowercase name used in statistics and logs.
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Rtcm => "rtcm",
            PacketKind::Ubx => "ubx",
            PacketKind::Nmea => "nmea",
            PacketKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One framed packet from a correction stream.
///
/// The payload holds the complete raw frame, including sync bytes and
/// checksums, so that forwarding a packet reproduces the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtkPacket {
    /// Packet classification.
    pub kind: PacketKind,
    /// Raw frame bytes.
    pub payload: Bytes,
}

impl RtkPacket {
    /// Creates a packet from raw bytes.
    pub fn new(kind: PacketKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ============================================================================
// Parser and Encoder Traits
// ============================================================================

/// Stateful splitter that turns a byte stream into packets.
///
/// Implementations buffer partial frames between calls; feeding a frame in
/// arbitrary chunk sizes yields the same packets as feeding it whole. A fresh
/// parser is created per source connection and recreated after a reconnect,
/// since framing state cannot survive a gap in the stream.
pub trait PacketParser: Send {
    /// Consumes a chunk of raw bytes and returns all packets completed by it.
    fn push(&mut self, chunk: &[u8]) -> Vec<RtkPacket>;
}

/// Converts an accepted packet back into wire bytes for subscribers.
pub trait PacketEncoder: Send + Sync {
    /// Encodes a packet for forwarding.
    fn encode(&self, packet: &RtkPacket) -> Bytes;
}

/// Parser for opaque streams: every chunk becomes one `Unknown` packet.
#[derive(Debug, Default)]
pub struct PassthroughParser;

impl PacketParser for PassthroughParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<RtkPacket> {
        if chunk.is_empty() {
            Vec::new()
        } else {
            vec![RtkPacket::new(PacketKind::Unknown, chunk.to_vec())]
        }
    }
}

/// Encoder that forwards the raw frame bytes unchanged.
#[derive(Debug, Default)]
pub struct PassthroughEncoder;

impl PacketEncoder for PassthroughEncoder {
    fn encode(&self, packet: &RtkPacket) -> Bytes {
        packet.payload.clone()
    }
}

// ============================================================================
// Preset Format
// ============================================================================

/// Stream format declared by a preset.
///
/// Determines how source bytes are parsed and which packets are forwarded.
/// Unrecognized format names deserialize to [`PresetFormat::Other`] rather
/// than failing, so a preset with an exotic format still relays its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresetFormat {
    /// Detect RTCM3 and UBX framing, forward corrections only.
    #[default]
    Auto,
    /// u-blox stream; same framing as `Auto` but marks the source as a
    /// u-blox receiver for survey configuration.
    Ubx,
    /// Opaque stream forwarded verbatim.
    Other,
}

impl PresetFormat {
    /// Parses a format name, mapping anything unrecognized to `Other`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "auto" => PresetFormat::Auto,
            "ubx" => PresetFormat::Ubx,
            _ => PresetFormat::Other,
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            PresetFormat::Auto => "auto",
            PresetFormat::Ubx => "ubx",
            PresetFormat::Other => "other",
        }
    }
}

impl fmt::Display for PresetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PresetFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PresetFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(PresetFormat::from_name(&name))
    }
}

// ============================================================================
// Codec Strategy
// ============================================================================

/// Per-format bundle of parser factory, encoder factory and forwarding rule.
///
/// Strategies are static: presets hold a `&'static CodecStrategy` resolved
/// once from their format, and the supervision tree creates a fresh parser
/// from it for every source connection.
pub struct CodecStrategy {
    /// Whether sources with this strategy can be put into survey-in mode.
    survey_capable: bool,
    make_parser: fn() -> Box<dyn PacketParser>,
    make_encoder: fn() -> Box<dyn PacketEncoder>,
    accept: fn(&RtkPacket) -> bool,
}

fn make_frame_parser() -> Box<dyn PacketParser> {
    Box::new(FrameParser::new())
}

fn make_passthrough_parser() -> Box<dyn PacketParser> {
    Box::new(PassthroughParser)
}

fn make_passthrough_encoder() -> Box<dyn PacketEncoder> {
    Box::new(PassthroughEncoder)
}

fn accept_corrections(packet: &RtkPacket) -> bool {
    matches!(packet.kind, PacketKind::Rtcm | PacketKind::Ubx)
}

fn accept_all(_packet: &RtkPacket) -> bool {
    true
}

static FRAMED_STRATEGY: CodecStrategy = CodecStrategy {
    survey_capable: true,
    make_parser: make_frame_parser,
    make_encoder: make_passthrough_encoder,
    accept: accept_corrections,
};

static OPAQUE_STRATEGY: CodecStrategy = CodecStrategy {
    survey_capable: false,
    make_parser: make_passthrough_parser,
    make_encoder: make_passthrough_encoder,
    accept: accept_all,
};

impl CodecStrategy {
    /// Resolves the strategy for a preset format.
    pub fn for_format(format: PresetFormat) -> &'static CodecStrategy {
        match format {
            PresetFormat::Auto | PresetFormat::Ubx => &FRAMED_STRATEGY,
            PresetFormat::Other => &OPAQUE_STRATEGY,
        }
    }

    /// Creates a fresh parser with empty framing state.
    pub fn new_parser(&self) -> Box<dyn PacketParser> {
        (self.make_parser)()
    }

    /// Creates an encoder for forwarded packets.
    pub fn new_encoder(&self) -> Box<dyn PacketEncoder> {
        (self.make_encoder)()
    }

    /// Returns true if the packet should be forwarded to subscribers.
    pub fn accepts(&self, packet: &RtkPacket) -> bool {
        (self.accept)(packet)
    }

    /// Whether sources using this strategy accept survey-in configuration.
    pub fn survey_capable(&self) -> bool {
        self.survey_capable
    }
}

impl fmt::Debug for CodecStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecStrategy")
            .field("survey_capable", &self.survey_capable)
            .finish()
    }
}
