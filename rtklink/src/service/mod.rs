//! Service assembly and lifecycle.
//!
//! This module wires the daemons together and manages their lifecycles. The
//! service owns two background tasks: the preset switcher, which serializes
//! activation and teardown of supervision trees, and the discovery
//! reconciler, which maintains dynamic presets for attached serial ports.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          RtkService                           │
//! │                                                               │
//! │  ┌────────────┐  switch requests   ┌─────────────────────┐    │
//! │  │ RtkHandle  │──────────────────► │  PresetSwitcher     │    │
//! │  │ (cloneable │                    │  └─ supervision tree│    │
//! │  │  control)  │ ◄───── current ────│     per activation  │    │
//! │  └────────────┘       (watch)      └─────────────────────┘    │
//! │        │                                    ▲                 │
//! │        │ hotplug                            │ switch requests │
//! │        ▼                                    │                 │
//! │  ┌─────────────────────┐                    │                 │
//! │  │ DiscoveryReconciler │────────────────────┘                 │
//! │  └─────────────────────┘                                      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use rtklink::config::RtkConfig;
//! use rtklink::service::RtkServiceBuilder;
//!
//! let config = RtkConfig::load_from("rtk.json")?;
//! let (service, handle) = RtkServiceBuilder::new(config).start();
//!
//! handle.select_source(Some("base")).await?;
//!
//! // When shutting down
//! service.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RtkConfig;
use crate::connection::{ConnectionFactory, ConnectionRegistry, DefaultConnectionFactory};
use crate::discovery::{DiscoveryOptions, DiscoveryReconciler, SharedLastRequest};
use crate::ports::{PortFilter, PortScanner, SerialPortScanner};
use crate::preset::PresetCatalog;
use crate::statistics::RtkStatistics;
use crate::supervisor::{PresetSwitcher, SupervisorContext};
use crate::survey::{
    SharedSurveySettings, SurveyConfigurator, SurveySettings, SurveyTrigger, UbxSurveyConfigurator,
};

mod error;
mod handle;

pub use error::ControlError;
pub use handle::RtkHandle;

/// Capacity of the forwarded packet broadcast.
const RELAY_QUEUE_DEPTH: usize = 256;

/// Capacity of the hotplug notification queue. Notifications are collapsed,
/// a small queue is plenty.
const HOTPLUG_QUEUE_DEPTH: usize = 4;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`RtkService`].
///
/// The defaults talk to real hardware: serial port enumeration through the
/// operating system, real serial and TCP connections, and u-blox survey
/// configuration. Tests swap these seams for mocks.
pub struct RtkServiceBuilder {
    config: RtkConfig,
    scanner: Arc<dyn PortScanner>,
    factory: Arc<dyn ConnectionFactory>,
    configurator: Arc<dyn SurveyConfigurator>,
    discovery: DiscoveryOptions,
}

impl RtkServiceBuilder {
    pub fn new(config: RtkConfig) -> Self {
        Self {
            config,
            scanner: Arc::new(SerialPortScanner::new()),
            factory: Arc::new(DefaultConnectionFactory::new()),
            configurator: Arc::new(UbxSurveyConfigurator::new()),
            discovery: DiscoveryOptions::default(),
        }
    }

    /// Replaces the serial port scanner.
    pub fn with_scanner(mut self, scanner: Arc<dyn PortScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Replaces the connection factory.
    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Replaces the survey configurator.
    pub fn with_configurator(mut self, configurator: Arc<dyn SurveyConfigurator>) -> Self {
        self.configurator = configurator;
        self
    }

    /// Overrides discovery tuning, e.g. the reconnection grace window.
    pub fn with_discovery_options(mut self, options: DiscoveryOptions) -> Self {
        self.discovery = options;
        self
    }

    /// Starts the service; both daemons spawn immediately.
    pub fn start(self) -> (RtkService, RtkHandle) {
        info!("Starting RTK service");

        let catalog = Arc::new(PresetCatalog::new());
        for preset in self.config.static_presets() {
            catalog.add(preset);
        }

        let statistics = RtkStatistics::new();
        let registry = ConnectionRegistry::new();
        let survey_settings = SharedSurveySettings::new(SurveySettings::default());
        let survey_trigger = SurveyTrigger::new();
        let (relay, _) = broadcast::channel(RELAY_QUEUE_DEPTH);

        let context = SupervisorContext {
            statistics: statistics.clone(),
            registry: registry.clone(),
            factory: self.factory,
            configurator: self.configurator,
            relay: relay.clone(),
            survey_trigger: survey_trigger.clone(),
            survey_settings: survey_settings.clone(),
            id_format: self.config.id_format.clone(),
            high_precision: self.config.use_high_precision,
        };
        let (switcher, switch_requests, current) = PresetSwitcher::new(context);

        let last_request = SharedLastRequest::new();
        let (hotplug_tx, hotplug_rx) = mpsc::channel(HOTPLUG_QUEUE_DEPTH);
        let reconciler = DiscoveryReconciler::new(
            self.scanner,
            PortFilter::new(&self.config.exclusion_patterns()),
            self.config.serial_port_templates(),
            Arc::clone(&catalog),
            self.discovery,
            switch_requests.clone(),
            current.clone(),
            last_request.clone(),
            hotplug_rx,
        );

        let shutdown = CancellationToken::new();
        let switcher_handle = tokio::spawn(switcher.run(shutdown.clone()));
        let reconciler_handle = tokio::spawn(reconciler.run(shutdown.clone()));

        let handle = RtkHandle {
            catalog,
            switch_requests,
            current,
            statistics,
            registry,
            relay,
            survey_settings,
            survey_trigger,
            last_request,
            hotplug: hotplug_tx,
        };
        let service = RtkService {
            shutdown,
            switcher: Some(switcher_handle),
            reconciler: Some(reconciler_handle),
        };
        info!(presets = handle.source_ids().len(), "RTK service started");
        (service, handle)
    }
}

// ============================================================================
// Service
// ============================================================================

/// A running RTK correction service.
///
/// # Lifecycle
///
/// 1. **Creation**: [`RtkServiceBuilder::start`] spawns the daemons
/// 2. **Operation**: control happens through cloned [`RtkHandle`]s
/// 3. **Shutdown**: [`shutdown`](RtkService::shutdown) cancels the daemons
///    and waits for the active supervision tree to unwind
pub struct RtkService {
    shutdown: CancellationToken,
    switcher: Option<JoinHandle<()>>,
    reconciler: Option<JoinHandle<()>>,
}

impl RtkService {
    /// Token cancelled when the service shuts down; other components can
    /// listen to it to coordinate their own teardown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the daemons are still running.
    pub fn is_running(&self) -> bool {
        self.switcher
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Shuts down gracefully: deactivates the current preset, waits for its
    /// tree to unwind, then stops both daemons.
    pub async fn shutdown(mut self) {
        info!("Shutting down RTK service");
        self.shutdown.cancel();
        if let Some(handle) = self.switcher.take() {
            match handle.await {
                Ok(()) => debug!("Preset switcher shut down cleanly"),
                Err(error) => error!("Preset switcher task panicked: {}", error),
            }
        }
        if let Some(handle) = self.reconciler.take() {
            match handle.await {
                Ok(()) => debug!("Discovery reconciler shut down cleanly"),
                Err(error) => error!("Discovery reconciler task panicked: {}", error),
            }
        }
        info!("RTK service stopped");
    }
}
