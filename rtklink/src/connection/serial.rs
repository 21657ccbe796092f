//! Serial port connection driven by a blocking reader thread.
//!
//! The `serialport` crate is synchronous, so each serial connection runs its
//! own OS thread. Reads use a short timeout to keep the thread responsive to
//! cancellation; queued writes are drained between reads, which bounds write
//! latency by the read timeout.

use std::io::{Read, Write};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::link::{link_pair, DriverSide, LinkHandle, PumpEnd};
use super::{reconnect_delay, ConnectionError, LinkEvent, RtkConnection};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Self-reconnecting serial link.
#[derive(Debug)]
pub struct SerialConnection {
    link: LinkHandle,
}

impl SerialConnection {
    /// Starts the reader thread and returns the connection handle.
    ///
    /// Opening happens lazily on the thread; a missing device is retried
    /// with backoff instead of failing construction.
    pub fn spawn(path: String, baud: u32) -> Self {
        let name = format!("serial:{}?baud={}", path, baud);
        let (link, driver) = link_pair(name);
        std::thread::spawn(move || run_driver(path, baud, driver));
        Self { link }
    }
}

impl RtkConnection for SerialConnection {
    fn name(&self) -> &str {
        self.link.name()
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn wait_until_connected(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(self.link.wait_until_connected())
    }

    fn recv(&self) -> BoxFuture<'_, Option<LinkEvent>> {
        Box::pin(self.link.recv())
    }

    fn send(&self, data: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(self.link.send(data))
    }
}

fn run_driver(path: String, baud: u32, mut driver: DriverSide) {
    let mut attempt: u32 = 0;
    let mut reported = false;
    loop {
        if driver.cancel.is_cancelled() {
            break;
        }
        match serialport::new(path.as_str(), baud)
            .timeout(READ_TIMEOUT)
            .open()
        {
            Ok(mut port) => {
                attempt = 0;
                reported = false;
                driver.connected.send_replace(true);
                debug!(path = %path, baud, "Serial port opened");
                if driver.events.blocking_send(LinkEvent::Connected).is_err() {
                    break;
                }
                let end = pump(&mut port, &mut driver);
                driver.connected.send_replace(false);
                if driver.events.blocking_send(LinkEvent::Disconnected).is_err() {
                    break;
                }
                if end == PumpEnd::Cancelled {
                    break;
                }
                warn!(path = %path, "Serial port lost; reconnecting");
            }
            Err(error) => {
                if !reported {
                    warn!(path = %path, error = %error, "Cannot open serial port; will retry");
                    reported = true;
                }
            }
        }
        if !sleep_with_cancel(reconnect_delay(attempt), &driver.cancel) {
            break;
        }
        attempt = attempt.saturating_add(1);
    }
    debug!(path = %path, "Serial driver stopped");
}

fn pump(port: &mut Box<dyn serialport::SerialPort>, driver: &mut DriverSide) -> PumpEnd {
    let mut buf = [0u8; 1024];
    loop {
        if driver.cancel.is_cancelled() {
            return PumpEnd::Cancelled;
        }
        // Drain queued writes before blocking on the next read.
        loop {
            match driver.writes.try_recv() {
                Ok(data) => {
                    if let Err(error) = port.write_all(&data) {
                        warn!(error = %error, "Serial write failed");
                        return PumpEnd::Lost;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return PumpEnd::Cancelled,
            }
        }
        match port.read(&mut buf) {
            Ok(0) => return PumpEnd::Lost,
            Ok(n) => {
                let chunk = LinkEvent::Data(Bytes::copy_from_slice(&buf[..n]));
                if driver.events.blocking_send(chunk).is_err() {
                    return PumpEnd::Cancelled;
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return PumpEnd::Lost,
        }
    }
}

/// Sleeps in short steps so cancellation interrupts the backoff.
/// Returns false if cancelled.
fn sleep_with_cancel(total: Duration, cancel: &CancellationToken) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(CANCEL_POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_missing_device_stays_disconnected() {
        let conn = SerialConnection::spawn("/nonexistent/rtk-port".to_string(), 115_200);
        assert!(!conn.is_connected());
        // No events while the driver retries the open.
        let pending = timeout(Duration::from_millis(300), conn.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_send_fails_while_disconnected() {
        let conn = SerialConnection::spawn("/nonexistent/rtk-port".to_string(), 115_200);
        let result = conn.send(vec![0xB5, 0x62]).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }
}
