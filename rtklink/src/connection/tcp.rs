//! TCP connection driven by an async task.

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::link::{link_pair, DriverSide, LinkHandle, PumpEnd};
use super::{reconnect_delay, ConnectionError, LinkEvent, RtkConnection};

/// Self-reconnecting TCP link.
///
/// Must be spawned from within a Tokio runtime; the driver task lives until
/// the connection handle is dropped.
#[derive(Debug)]
pub struct TcpConnection {
    link: LinkHandle,
}

impl TcpConnection {
    pub fn spawn(host: String, port: u16) -> Self {
        let name = format!("tcp:{}:{}", host, port);
        let (link, driver) = link_pair(name);
        tokio::spawn(run_driver(host, port, driver));
        Self { link }
    }
}

impl RtkConnection for TcpConnection {
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

async fn run_driver(host: String, port: u16, mut driver: DriverSide) {
    let mut attempt: u32 = 0;
    let mut reported = false;
    loop {
        let result = tokio::select! {
            biased;
            _ = driver.cancel.cancelled() => break,
            result = TcpStream::connect((host.as_str(), port)) => result,
        };
        match result {
            Ok(stream) => {
                attempt = 0;
                reported = false;
                let _ = stream.set_nodelay(true);
                driver.connected.send_replace(true);
                debug!(host = %host, port, "TCP link established");
                if driver.events.send(LinkEvent::Connected).await.is_err() {
                    break;
                }
                let end = pump(stream, &mut driver).await;
                driver.connected.send_replace(false);
                if driver.events.send(LinkEvent::Disconnected).await.is_err() {
                    break;
                }
                if end == PumpEnd::Cancelled {
                    break;
                }
                warn!(host = %host, port, "TCP link lost; reconnecting");
            }
            Err(error) => {
                if !reported {
                    warn!(host = %host, port, error = %error, "Cannot connect; will retry");
                    reported = true;
                }
            }
        }
        tokio::select! {
            biased;
            _ = driver.cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay(attempt)) => {}
        }
        attempt = attempt.saturating_add(1);
    }
    debug!(host = %host, port, "TCP driver stopped");
}

async fn pump(stream: TcpStream, driver: &mut DriverSide) -> PumpEnd {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            biased;
            _ = driver.cancel.cancelled() => return PumpEnd::Cancelled,
            queued = driver.writes.recv() => match queued {
                Some(data) => {
                    if writer.write_all(&data).await.is_err() {
                        return PumpEnd::Lost;
                    }
                }
                None => return PumpEnd::Cancelled,
            },
            result = reader.read(&mut buf) => match result {
                Ok(0) => return PumpEnd::Lost,
                Ok(n) => {
                    let chunk = LinkEvent::Data(Bytes::copy_from_slice(&buf[..n]));
                    if driver.events.send(chunk).await.is_err() {
                        return PumpEnd::Cancelled;
                    }
                }
                Err(_) => return PumpEnd::Lost,
            },
        }
    }
}
