//! Correction source connections.
//!
//! A preset names one or more sources; each source becomes an
//! [`RtkConnection`] that delivers raw bytes to the supervision tree. The
//! trait hides the transport: serial links run a blocking reader thread,
//! TCP links run an async driver task. Both reconnect on their own with
//! exponential backoff, so the read loop above them only ever sees a stream
//! of [`LinkEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐        ┌───────────────────────────┐
//! │  ConnectionFactory │──────► │ RtkConnection (Arc<dyn>)  │
//! │  (per SourceSpec)  │        │  recv() → LinkEvent       │
//! └────────────────────┘        │  send() ← survey frames   │
//!                               └────────────┬──────────────┘
//!                                            │ driver (thread or task)
//!                                            ▼
//!                               open → read/write → backoff → reopen
//! ```
//!
//! Dropping a connection cancels its driver; the next `recv()` then returns
//! `None` once the event queue drains.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::ports::DEFAULT_BAUD;

mod backoff;
mod link;
mod registry;
mod serial;
mod tcp;

pub use registry::{ConnectionRegistry, RegisteredConnection, RegistrationHandle};
pub use serial::SerialConnection;
pub use tcp::TcpConnection;

pub(crate) use backoff::reconnect_delay;

// ============================================================================
// Source Descriptors
// ============================================================================

/// Parsed form of a preset source entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Local serial device.
    Serial { path: String, baud: u32 },
    /// TCP stream, e.g. an NTRIP-less raw caster.
    Tcp { host: String, port: u16 },
}

impl SourceSpec {
    pub fn serial(path: impl Into<String>, baud: u32) -> Self {
        SourceSpec::Serial {
            path: path.into(),
            baud,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        SourceSpec::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parses a source descriptor such as `serial:/dev/ttyUSB0?baud=57600`
    /// or `tcp:rtk.example.com:2101`.
    pub fn parse(descriptor: &str) -> Result<Self, ConnectionError> {
        let (scheme, rest) = descriptor
            .split_once(':')
            .ok_or_else(|| ConnectionError::InvalidDescriptor(descriptor.to_string()))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        match scheme {
            "serial" => {
                let (path, baud) = match rest.split_once('?') {
                    None => (rest, DEFAULT_BAUD),
                    Some((path, query)) => {
                        let baud = query
                            .strip_prefix("baud=")
                            .and_then(|value| value.parse::<u32>().ok())
                            .ok_or_else(|| {
                                ConnectionError::InvalidDescriptor(descriptor.to_string())
                            })?;
                        (path, baud)
                    }
                };
                if path.is_empty() {
                    return Err(ConnectionError::InvalidDescriptor(descriptor.to_string()));
                }
                Ok(SourceSpec::serial(path, baud))
            }
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| ConnectionError::InvalidDescriptor(descriptor.to_string()))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConnectionError::InvalidDescriptor(descriptor.to_string()))?;
                if host.is_empty() {
                    return Err(ConnectionError::InvalidDescriptor(descriptor.to_string()));
                }
                Ok(SourceSpec::tcp(host, port))
            }
            _ => Err(ConnectionError::InvalidDescriptor(descriptor.to_string())),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Serial { path, baud } => write!(f, "serial:{}?baud={}", path, baud),
            SourceSpec::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

// ============================================================================
// Connection Trait
// ============================================================================

/// State change or data delivery from a connection driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Transport became connected.
    Connected,
    /// Raw bytes arrived.
    Data(Bytes),
    /// Transport dropped; the driver will retry with backoff.
    Disconnected,
}

/// A supervised, self-reconnecting byte stream to one correction source.
///
/// `recv` is intended for a single consumer (the per-source read loop);
/// `send` and `wait_until_connected` may be called from elsewhere, which is
/// how survey configuration reaches the receiver.
pub trait RtkConnection: Send + Sync {
    /// Display name for logs and the connection registry.
    fn name(&self) -> &str;

    /// Current transport state.
    fn is_connected(&self) -> bool;

    /// Resolves once the transport is connected.
    fn wait_until_connected(&self) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Next event from the driver; `None` once the connection is closed.
    fn recv(&self) -> BoxFuture<'_, Option<LinkEvent>>;

    /// Writes bytes to the source.
    fn send(&self, data: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>>;
}

/// Creates connections from source descriptors.
///
/// The supervision tree goes through this seam so that tests can substitute
/// scripted connections for real transports.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, spec: &SourceSpec) -> Result<Arc<dyn RtkConnection>, ConnectionError>;
}

/// Production factory dispatching on the source transport.
#[derive(Debug, Default, Clone)]
pub struct DefaultConnectionFactory;

impl DefaultConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn connect(&self, spec: &SourceSpec) -> Result<Arc<dyn RtkConnection>, ConnectionError> {
        match spec {
            SourceSpec::Serial { path, baud } => {
                Ok(Arc::new(SerialConnection::spawn(path.clone(), *baud)))
            }
            SourceSpec::Tcp { host, port } => {
                Ok(Arc::new(TcpConnection::spawn(host.clone(), *port)))
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from connection construction and I/O.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The source descriptor string could not be parsed.
    #[error("invalid source descriptor: {0}")]
    InvalidDescriptor(String),

    /// The connection driver has shut down.
    #[error("connection closed")]
    Closed,

    /// A write was attempted while the transport is down.
    #[error("not connected")]
    NotConnected,

    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_with_baud() {
        let spec = SourceSpec::parse("serial:/dev/ttyUSB0?baud=57600").unwrap();
        assert_eq!(spec, SourceSpec::serial("/dev/ttyUSB0", 57600));
    }

    #[test]
    fn test_parse_serial_default_baud() {
        let spec = SourceSpec::parse("serial:/dev/ttyACM1").unwrap();
        assert_eq!(spec, SourceSpec::serial("/dev/ttyACM1", DEFAULT_BAUD));
    }

    #[test]
    fn test_parse_tcp() {
        let spec = SourceSpec::parse("tcp:rtk.example.com:2101").unwrap();
        assert_eq!(spec, SourceSpec::tcp("rtk.example.com", 2101));
        let spec = SourceSpec::parse("tcp://10.0.0.5:9000").unwrap();
        assert_eq!(spec, SourceSpec::tcp("10.0.0.5", 9000));
    }

    #[test]
    fn test_parse_rejects_bad_descriptors() {
        for descriptor in [
            "",
            "/dev/ttyUSB0",
            "serial:",
            "serial:/dev/ttyUSB0?baud=fast",
            "tcp:no-port",
            "tcp::2101",
            "ftp:host:21",
        ] {
            assert!(
                SourceSpec::parse(descriptor).is_err(),
                "descriptor {:?} should be rejected",
                descriptor
            );
        }
    }

    #[test]
    fn test_display_round_trips() {
        let spec = SourceSpec::serial("/dev/ttyUSB0", 57600);
        assert_eq!(SourceSpec::parse(&spec.to_string()).unwrap(), spec);
        let spec = SourceSpec::tcp("localhost", 2101);
        assert_eq!(SourceSpec::parse(&spec.to_string()).unwrap(), spec);
    }
}
