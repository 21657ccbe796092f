//! Consumer-side plumbing shared by the serial and TCP drivers.

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::{ConnectionError, LinkEvent};

/// Buffered events between driver and read loop.
pub(super) const EVENT_QUEUE_DEPTH: usize = 64;

/// Pending outbound writes (survey configuration frames).
pub(super) const WRITE_QUEUE_DEPTH: usize = 8;

/// How a driver session ended.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum PumpEnd {
    /// The connection was cancelled; the driver must exit.
    Cancelled,
    /// The transport failed; the driver should back off and reopen.
    Lost,
}

/// The half of a connection owned by its public handle.
#[derive(Debug)]
pub(super) struct LinkHandle {
    name: String,
    connected: watch::Receiver<bool>,
    events: Mutex<mpsc::Receiver<LinkEvent>>,
    writer: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// The half of a connection handed to the driver.
#[derive(Debug)]
pub(super) struct DriverSide {
    pub connected: watch::Sender<bool>,
    pub events: mpsc::Sender<LinkEvent>,
    pub writes: mpsc::Receiver<Vec<u8>>,
    pub cancel: CancellationToken,
}

/// Creates the channel plumbing for one connection.
pub(super) fn link_pair(name: String) -> (LinkHandle, DriverSide) {
    let (connected_tx, connected_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let cancel = CancellationToken::new();
    (
        LinkHandle {
            name,
            connected: connected_rx,
            events: Mutex::new(events_rx),
            writer: writer_tx,
            cancel: cancel.clone(),
        },
        DriverSide {
            connected: connected_tx,
            events: events_tx,
            writes: writer_rx,
            cancel,
        },
    )
}

impl LinkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub async fn wait_until_connected(&self) -> Result<(), ConnectionError> {
        let mut rx = self.connected.clone();
        rx.wait_for(|connected| *connected)
            .await
            .map(|_| ())
            .map_err(|_| ConnectionError::Closed)
    }

    pub async fn recv(&self) -> Option<LinkEvent> {
        self.events.lock().await.recv().await
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.writer
            .send(data)
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
