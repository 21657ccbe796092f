//! Dynamic preset discovery driven by serial port hotplug.
//!
//! When the configuration enables `add_serial_ports`, every detected serial
//! port yields one preset per template. This daemon keeps the catalog in
//! step with the ports that actually exist: a hotplug notification triggers
//! a reconcile pass that removes presets whose device vanished and adds
//! presets for newly seen devices, removals before additions so a replug
//! lands on a fresh entry.
//!
//! After reconciling, the daemon applies the reconnection policy. If the
//! active preset no longer exists it asks the switcher to deactivate. If
//! nothing is active but the user's most recent choice reappeared within
//! the grace window, it re-requests that preset and refreshes the window,
//! so a radio that keeps dropping off USB keeps coming back as long as each
//! gap stays under the grace period.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ports::{dynamic_preset_id, PortFilter, PortScanner, SerialPortTemplate};
use crate::preset::{PresetCatalog, RtkPreset};
use crate::supervisor::SwitchRequest;

/// How long a user's preset choice survives the device disappearing.
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(30);

/// Notification that the set of serial ports may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugEvent;

/// Tuning knobs for the reconciler.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Reconnection grace window; measured from the last explicit preset
    /// request, refreshed on every automatic re-request.
    pub reconnect_grace: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
        }
    }
}

// ============================================================================
// Last Request Tracking
// ============================================================================

#[derive(Debug, Clone)]
struct LastRequest {
    preset_id: String,
    requested_at: Instant,
}

/// Remembers the preset the user asked for most recently.
///
/// Written by the service handle on every explicit selection; read by the
/// reconciler to decide whether a reappeared device should be reactivated.
#[derive(Debug, Clone, Default)]
pub struct SharedLastRequest {
    inner: Arc<Mutex<Option<LastRequest>>>,
}

impl SharedLastRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an explicit selection.
    pub fn record(&self, preset_id: &str) {
        *self.inner.lock().unwrap() = Some(LastRequest {
            preset_id: preset_id.to_string(),
            requested_at: Instant::now(),
        });
    }

    /// Forgets the selection; called when the user deactivates explicitly.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    /// Refreshes the timestamp, extending the grace window.
    pub fn touch(&self) {
        if let Some(request) = self.inner.lock().unwrap().as_mut() {
            request.requested_at = Instant::now();
        }
    }

    /// The remembered preset ID and the age of the request.
    pub fn get(&self) -> Option<(String, Duration)> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|request| (request.preset_id.clone(), request.requested_at.elapsed()))
    }
}

// ============================================================================
// Reconciler Daemon
// ============================================================================

/// Daemon keeping dynamic presets in step with attached serial ports.
pub struct DiscoveryReconciler {
    scanner: Arc<dyn PortScanner>,
    filter: PortFilter,
    templates: Vec<SerialPortTemplate>,
    catalog: Arc<PresetCatalog>,
    options: DiscoveryOptions,
    switch_requests: mpsc::Sender<SwitchRequest>,
    current: watch::Receiver<SwitchRequest>,
    last_request: SharedLastRequest,
    hotplug: mpsc::Receiver<HotplugEvent>,
    first_pass: bool,
}

impl DiscoveryReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scanner: Arc<dyn PortScanner>,
        filter: PortFilter,
        templates: Vec<SerialPortTemplate>,
        catalog: Arc<PresetCatalog>,
        options: DiscoveryOptions,
        switch_requests: mpsc::Sender<SwitchRequest>,
        current: watch::Receiver<SwitchRequest>,
        last_request: SharedLastRequest,
        hotplug: mpsc::Receiver<HotplugEvent>,
    ) -> Self {
        Self {
            scanner,
            filter,
            templates,
            catalog,
            options,
            switch_requests,
            current,
            last_request,
            hotplug,
            first_pass: true,
        }
    }

    /// Runs until shutdown. One reconcile pass happens immediately so that
    /// ports present at startup are offered without waiting for an event.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if !self.templates.is_empty() {
            info!(
                templates = self.templates.len(),
                "Dynamic preset discovery enabled"
            );
        }
        self.reconcile().await;
        self.first_pass = false;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.hotplug.recv() => match event {
                    Some(HotplugEvent) => {
                        debug!("Serial port change notification received");
                        self.reconcile().await;
                    }
                    None => break,
                },
            }
        }
        debug!("Discovery reconciler stopped");
    }

    async fn reconcile(&mut self) {
        // Without templates there are no dynamic presets to manage, and the
        // reconnection policy stays out of the picture entirely.
        if self.templates.is_empty() {
            return;
        }
        let distinguish_titles = self.templates.len() > 1;
        let ports = self.scanner.scan();

        let mut seen = HashSet::new();
        let mut discovered = Vec::new();
        for port in &ports {
            if self.filter.excludes(port) {
                continue;
            }
            for index in 0..self.templates.len() {
                let preset_id = dynamic_preset_id(&port.device, index);
                if self.catalog.contains(&preset_id) {
                    seen.insert(preset_id);
                } else {
                    discovered.push((preset_id, port.clone(), index));
                }
            }
        }

        // Removals before additions: a replugged device must not race its
        // own stale entry. Only dynamic entries are eligible; a static
        // preset that shares an ID with a discovered one is left alone.
        for id in self.catalog.ids() {
            if seen.contains(&id) {
                continue;
            }
            match self.catalog.get(&id) {
                Some(preset) if preset.is_dynamic() => {
                    self.catalog.remove(&id);
                    info!(
                        preset = %preset.title(),
                        id = %id,
                        "Removing RTK preset because the device was unplugged"
                    );
                }
                _ => {}
            }
        }
        for (preset_id, port, index) in discovered {
            let template = &self.templates[index];
            let preset = Arc::new(RtkPreset::from_serial_port(
                preset_id,
                &port,
                template,
                distinguish_titles,
            ));
            if !self.first_pass {
                info!(
                    preset = %preset.title(),
                    device = %port.device,
                    "Added new RTK preset for serial port"
                );
            }
            self.catalog.add(preset);
        }

        self.apply_reconnection_policy().await;
    }

    /// Deactivates a vanished preset, or revives the user's last choice if
    /// it reappeared within the grace window.
    async fn apply_reconnection_policy(&mut self) {
        let active = self.current.borrow().clone();
        if let Some(active) = active {
            if !self.catalog.contains(active.id()) {
                info!(preset = %active.title(), "Active preset disappeared; deactivating");
                if self.switch_requests.send(None).await.is_err() {
                    warn!("Cannot request deactivation; the switcher is not running");
                }
            }
            return;
        }

        let Some((preset_id, age)) = self.last_request.get() else {
            return;
        };
        // Requests exactly as old as the window no longer count.
        if age >= self.options.reconnect_grace {
            return;
        }
        let Some(preset) = self.catalog.get(&preset_id) else {
            return;
        };
        // Refresh so every successful revival restarts the window.
        self.last_request.touch();
        info!(preset = %preset.title(), "Re-connecting to RTK preset");
        if self.switch_requests.send(Some(preset)).await.is_err() {
            warn!("Cannot request reactivation; the switcher is not running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SourceSpec;
    use crate::packet::PresetFormat;
    use crate::ports::PortInfo;
    use crate::preset::SharedPreset;
    use tokio::time::{sleep, timeout};

    struct MockScanner {
        ports: Mutex<Vec<PortInfo>>,
    }

    impl MockScanner {
        fn new(ports: Vec<PortInfo>) -> Arc<Self> {
            Arc::new(Self {
                ports: Mutex::new(ports),
            })
        }

        fn set_ports(&self, ports: Vec<PortInfo>) {
            *self.ports.lock().unwrap() = ports;
        }
    }

    impl PortScanner for MockScanner {
        fn scan(&self) -> Vec<PortInfo> {
            self.ports.lock().unwrap().clone()
        }
    }

    struct Harness {
        scanner: Arc<MockScanner>,
        catalog: Arc<PresetCatalog>,
        switch_rx: mpsc::Receiver<SwitchRequest>,
        current_tx: watch::Sender<SwitchRequest>,
        hotplug_tx: mpsc::Sender<HotplugEvent>,
        last_request: SharedLastRequest,
        shutdown: CancellationToken,
        daemon: tokio::task::JoinHandle<()>,
    }

    fn start(
        ports: Vec<PortInfo>,
        templates: Vec<SerialPortTemplate>,
        exclude: &[String],
        options: DiscoveryOptions,
    ) -> Harness {
        let scanner = MockScanner::new(ports);
        let catalog = Arc::new(PresetCatalog::new());
        let (switch_tx, switch_rx) = mpsc::channel(1);
        let (current_tx, current_rx) = watch::channel(None);
        let (hotplug_tx, hotplug_rx) = mpsc::channel(4);
        let last_request = SharedLastRequest::new();
        let reconciler = DiscoveryReconciler::new(
            Arc::clone(&scanner) as Arc<dyn PortScanner>,
            PortFilter::new(exclude),
            templates,
            Arc::clone(&catalog),
            options,
            switch_tx,
            current_rx,
            last_request.clone(),
            hotplug_rx,
        );
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(reconciler.run(shutdown.clone()));
        Harness {
            scanner,
            catalog,
            switch_rx,
            current_tx,
            hotplug_tx,
            last_request,
            shutdown,
            daemon,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn usb0() -> PortInfo {
        PortInfo::new("/dev/ttyUSB0", "u-blox GNSS receiver")
    }

    fn static_preset(id: &str) -> SharedPreset {
        Arc::new(RtkPreset::new(
            id,
            id,
            vec![SourceSpec::serial("/dev/ttyUSB0", 115_200)],
            PresetFormat::Auto,
        ))
    }

    #[tokio::test]
    async fn test_startup_pass_offers_detected_ports() {
        let harness = start(
            vec![usb0(), PortInfo::new("/dev/ttyACM0", "Radio modem")],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 2).await;
        let ids = harness.catalog.ids();
        assert!(ids.contains(&"dev-ttyUSB0-0".to_string()));
        assert!(ids.contains(&"dev-ttyACM0-0".to_string()));

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_one_preset_per_template() {
        let harness = start(
            vec![usb0()],
            vec![
                SerialPortTemplate::with_baud(115_200),
                SerialPortTemplate::with_baud(57_600),
            ],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 2).await;
        let titles: Vec<String> = harness
            .catalog
            .ids()
            .iter()
            .map(|id| harness.catalog.get(id).unwrap().title().to_string())
            .collect();
        assert!(titles.contains(&"u-blox GNSS receiver (115200 baud)".to_string()));
        assert!(titles.contains(&"u-blox GNSS receiver (57600 baud)".to_string()));

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_excluded_ports_are_ignored() {
        let harness = start(
            vec![usb0(), PortInfo::new("/dev/ttyAMA0", "Onboard UART")],
            vec![SerialPortTemplate::default()],
            &["/dev/ttyAMA*".to_string()],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;
        assert_eq!(harness.catalog.ids(), vec!["dev-ttyUSB0-0"]);

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_for_unchanged_ports() {
        let mut harness = start(
            vec![usb0()],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;
        let before = harness.catalog.get("dev-ttyUSB0-0").unwrap();

        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        // Same port list: the preset is untouched and no switch is requested.
        let after = harness.catalog.get("dev-ttyUSB0-0").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(harness.switch_rx.try_recv().is_err());

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_static_preset_with_colliding_id_is_left_alone() {
        let harness = start(
            vec![usb0()],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;

        // Hand the ID over to a statically configured preset.
        let configured = static_preset("dev-ttyUSB0-0");
        harness.catalog.add(Arc::clone(&configured));

        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        // The reconciler marks the ID as seen; it neither replaces the
        // entry nor removes it as stale.
        let entry = harness.catalog.get("dev-ttyUSB0-0").unwrap();
        assert!(Arc::ptr_eq(&entry, &configured));
        assert!(!entry.is_dynamic());

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_static_presets_survive_hotplug_churn() {
        let harness = start(
            vec![usb0()],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;
        harness.catalog.add(static_preset("base"));

        // Unplug: only the dynamic preset goes away.
        harness.scanner.set_ports(vec![]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;
        assert_eq!(harness.catalog.ids(), vec!["base"]);

        // Replug: exactly the one dynamic preset comes back.
        harness.scanner.set_ports(vec![usb0()]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 2).await;
        assert_eq!(harness.catalog.ids(), vec!["base", "dev-ttyUSB0-0"]);

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_unplug_removes_preset_and_deactivates() {
        let mut harness = start(
            vec![usb0()],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;

        // Pretend the switcher activated the dynamic preset.
        let preset = harness.catalog.get("dev-ttyUSB0-0").unwrap();
        harness.current_tx.send_replace(Some(preset));

        harness.scanner.set_ports(vec![]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();

        let request = timeout(Duration::from_secs(2), harness.switch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(request.is_none(), "expected a deactivation request");
        assert!(harness.catalog.is_empty());

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replug_within_grace_reconnects() {
        let mut harness = start(
            vec![usb0()],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;

        // The user picked the preset, then the device vanished and the
        // switcher deactivated.
        harness.last_request.record("dev-ttyUSB0-0");
        harness.scanner.set_ports(vec![]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.is_empty()).await;
        harness.current_tx.send_replace(None);

        // Replug well inside the window.
        tokio::time::advance(Duration::from_secs(10)).await;
        harness.scanner.set_ports(vec![usb0()]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();

        let request = timeout(Duration::from_secs(2), harness.switch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let preset = request.expect("expected a reactivation request");
        assert_eq!(preset.id(), "dev-ttyUSB0-0");

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replug_after_grace_stays_inactive() {
        let mut harness = start(
            vec![usb0()],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;

        harness.last_request.record("dev-ttyUSB0-0");
        harness.scanner.set_ports(vec![]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.is_empty()).await;
        harness.current_tx.send_replace(None);

        tokio::time::advance(DEFAULT_RECONNECT_GRACE + Duration::from_secs(1)).await;
        harness.scanner.set_ports(vec![usb0()]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();

        // The preset is offered again but not activated.
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;
        let no_request = timeout(Duration::from_millis(200), harness.switch_rx.recv()).await;
        assert!(no_request.is_err(), "no switch request expected");

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replug_at_grace_boundary_stays_inactive() {
        let mut harness = start(
            vec![usb0()],
            vec![SerialPortTemplate::default()],
            &[],
            DiscoveryOptions::default(),
        );
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;

        harness.scanner.set_ports(vec![]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();
        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.is_empty()).await;

        // Pin the request age at exactly the window size. The paused clock
        // only moves through advance, so the reconcile pass observes the
        // boundary precisely.
        harness.last_request.record("dev-ttyUSB0-0");
        tokio::time::advance(DEFAULT_RECONNECT_GRACE).await;
        harness.scanner.set_ports(vec![usb0()]);
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();

        let catalog = Arc::clone(&harness.catalog);
        wait_for(move || catalog.len() == 1).await;
        let no_request = timeout(Duration::from_millis(200), harness.switch_rx.recv()).await;
        assert!(no_request.is_err(), "a request as old as the window must not revive");

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_without_templates_reconciliation_is_disabled() {
        let mut harness = start(
            vec![usb0()],
            Vec::new(),
            &[],
            DiscoveryOptions::default(),
        );
        // Even a dangling active preset is left alone.
        harness.current_tx.send_replace(Some(static_preset("ghost")));
        harness.hotplug_tx.send(HotplugEvent).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert!(harness.catalog.is_empty());
        let no_request = timeout(Duration::from_millis(100), harness.switch_rx.recv()).await;
        assert!(no_request.is_err());

        harness.shutdown.cancel();
        harness.daemon.await.unwrap();
    }
}
