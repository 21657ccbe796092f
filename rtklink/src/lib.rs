//! RTKLink - RTK correction streaming for drone fleets
//!
//! This library connects to RTK base stations over serial or TCP links,
//! frames the correction stream (RTCM3, UBX, NMEA) and relays it to
//! subscribers, typically a fleet of drones that needs a common correction
//! source. Sources are described by presets; exactly one preset is active
//! at a time and switching is atomic: the old connection tree is torn down
//! completely before the new one starts.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module is the entry point:
//!
//! ```ignore
//! use rtklink::config::RtkConfig;
//! use rtklink::service::RtkServiceBuilder;
//!
//! let config = RtkConfig::load_from("rtk.json")?;
//! let (service, handle) = RtkServiceBuilder::new(config).start();
//!
//! // Activate a base station and receive its corrections
//! handle.select_source(Some("base")).await?;
//! let mut corrections = handle.subscribe();
//!
//! // When shutting down
//! service.shutdown().await;
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod logging;
pub mod packet;
pub mod ports;
pub mod preset;
pub mod service;
pub mod statistics;
pub mod supervisor;
pub mod survey;

/// Version of the RTKLink library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
