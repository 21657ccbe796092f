//! Preset activation and supervision.
//!
//! At most one preset is active at a time. The [`PresetSwitcher`] daemon
//! owns that invariant: it consumes switch requests from a control channel,
//! tears the current supervision tree down completely, then starts the tree
//! for the requested preset and publishes it on a watch channel.
//!
//! # Architecture
//!
//! ```text
//!                 switch requests (mpsc, capacity 1)
//!                              │
//!                              ▼
//!                      ┌───────────────┐     current preset (watch)
//!                      │ PresetSwitcher │ ───────────────────────────►
//!                      └───────┬───────┘
//!                              │ one ActivePreset at a time
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  preset supervision    │  statistics scope
//!                  │  tree (cancellable)    │  connection registry entries
//!                  ├───────────┬───────────┤
//!                  │ source     │ survey    │
//!                  │ read loops │ trigger   │──► cancellable survey task
//!                  └───────────┴───────────┘
//! ```
//!
//! Teardown is cancellation plus join: cancelling the tree token stops the
//! read loops and any running survey, and the switcher waits for the whole
//! tree to unwind before the next preset starts. Observers of the watch
//! channel therefore never see two presets active, not even transiently.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{ConnectionFactory, ConnectionRegistry};
use crate::preset::SharedPreset;
use crate::statistics::RtkStatistics;
use crate::survey::{SharedSurveySettings, SurveyConfigurator, SurveyTrigger};

mod tree;

/// A request to activate a preset, or `None` to deactivate.
pub type SwitchRequest = Option<SharedPreset>;

/// Capacity of the switch request channel. One slot keeps requests ordered
/// while letting the sender return as soon as the switcher is able to pick
/// the request up.
pub const SWITCH_QUEUE_DEPTH: usize = 1;

/// One packet forwarded from the active preset to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedPacket {
    /// ID of the preset the packet came from.
    pub preset_id: String,
    /// Encoded wire bytes.
    pub payload: Bytes,
}

/// Shared dependencies handed to every preset supervision tree.
#[derive(Clone)]
pub struct SupervisorContext {
    pub statistics: RtkStatistics,
    pub registry: ConnectionRegistry,
    pub factory: Arc<dyn ConnectionFactory>,
    pub configurator: Arc<dyn SurveyConfigurator>,
    pub relay: broadcast::Sender<RelayedPacket>,
    pub survey_trigger: SurveyTrigger,
    pub survey_settings: SharedSurveySettings,
    /// Template for registry names; `{}` is replaced with the preset ID.
    pub id_format: String,
    /// Ask receivers for high precision output during surveys.
    pub high_precision: bool,
}

impl SupervisorContext {
    /// Registry name for connections of a preset.
    pub(crate) fn connection_name(&self, preset_id: &str) -> String {
        self.id_format.replacen("{}", preset_id, 1)
    }
}

// ============================================================================
// Switcher Daemon
// ============================================================================

/// Daemon that serializes preset switches.
///
/// Requests are processed strictly in order. A request naming the already
/// active preset is a no-op; anything else deactivates the current preset,
/// waits for its tree to unwind, and only then activates the new one.
pub struct PresetSwitcher {
    requests: mpsc::Receiver<SwitchRequest>,
    current: watch::Sender<SwitchRequest>,
    context: SupervisorContext,
}

impl PresetSwitcher {
    /// Creates the daemon plus the request sender and the current-preset
    /// watch it publishes to.
    pub fn new(
        context: SupervisorContext,
    ) -> (
        Self,
        mpsc::Sender<SwitchRequest>,
        watch::Receiver<SwitchRequest>,
    ) {
        let (request_tx, request_rx) = mpsc::channel(SWITCH_QUEUE_DEPTH);
        let (current_tx, current_rx) = watch::channel(None);
        (
            Self {
                requests: request_rx,
                current: current_tx,
                context,
            },
            request_tx,
            current_rx,
        )
    }

    /// Runs until shutdown; deactivates any active preset on the way out.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("Preset switcher started");
        let mut active: Option<ActivePreset> = None;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(target) => self.switch(&mut active, target).await,
                    None => break,
                },
            }
        }
        if let Some(previous) = active.take() {
            self.current.send_replace(None);
            info!(preset = %previous.preset.title(), "Deactivating RTK preset on shutdown");
            previous.stop().await;
        }
        debug!("Preset switcher stopped");
    }

    async fn switch(&mut self, active: &mut Option<ActivePreset>, target: SwitchRequest) {
        let current_id = active.as_ref().map(|a| a.preset.id());
        let target_id = target.as_ref().map(|p| p.id());
        if current_id == target_id {
            return;
        }
        if let Some(previous) = active.take() {
            self.current.send_replace(None);
            info!(preset = %previous.preset.title(), "Deactivating RTK preset");
            previous.stop().await;
        }
        if let Some(preset) = target {
            info!(preset = %preset.title(), id = %preset.id(), "Activating RTK preset");
            let running = ActivePreset::start(Arc::clone(&preset), self.context.clone());
            self.current.send_replace(Some(preset));
            *active = Some(running);
        }
    }
}

/// A running preset supervision tree.
struct ActivePreset {
    preset: SharedPreset,
    cancel: CancellationToken,
    tree: JoinHandle<()>,
}

impl ActivePreset {
    fn start(preset: SharedPreset, context: SupervisorContext) -> Self {
        // Arm before the tree runs so a raise that races activation is not
        // lost; the trigger is level-based, the tree picks it up whenever
        // its survey loop starts waiting.
        context.survey_trigger.set(preset.auto_survey());
        let cancel = CancellationToken::new();
        let tree = tokio::spawn(tree::run_preset_tree(
            Arc::clone(&preset),
            context,
            cancel.clone(),
        ));
        Self {
            preset,
            cancel,
            tree,
        }
    }

    /// Cancels the tree and waits for it to unwind completely.
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.tree.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio::time::{sleep, timeout};

    use crate::connection::{ConnectionError, LinkEvent, RtkConnection, SourceSpec};
    use crate::packet::PresetFormat;
    use crate::preset::RtkPreset;
    use crate::survey::{SurveyError, SurveyRequest, SurveySettings};

    struct MockConnection {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RtkConnection for MockConnection {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn wait_until_connected(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
            Box::pin(async { Ok(()) })
        }

        fn recv(&self) -> BoxFuture<'_, Option<LinkEvent>> {
            Box::pin(futures::future::pending())
        }

        fn send(&self, _data: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>> {
            Box::pin(async { Ok(()) })
        }
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            self.log.lock().unwrap().push(format!("drop:{}", self.name));
        }
    }

    #[derive(Default)]
    struct MockFactory {
        connects: AtomicUsize,
        log: Arc<Mutex<Vec<String>>>,
        /// Source paths that fail to connect.
        failing: Vec<String>,
    }

    impl ConnectionFactory for MockFactory {
        fn connect(&self, spec: &SourceSpec) -> Result<Arc<dyn RtkConnection>, ConnectionError> {
            let name = spec.to_string();
            if self.failing.iter().any(|f| name.contains(f.as_str())) {
                return Err(ConnectionError::InvalidDescriptor(name));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("connect:{}", name));
            Ok(Arc::new(MockConnection {
                name,
                log: Arc::clone(&self.log),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingConfigurator {
        requests: Mutex<Vec<SurveyRequest>>,
    }

    impl SurveyConfigurator for RecordingConfigurator {
        fn configure<'a>(
            &'a self,
            _connection: &'a dyn RtkConnection,
            request: &'a SurveyRequest,
        ) -> BoxFuture<'a, Result<(), SurveyError>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(*request);
                Ok(())
            })
        }
    }

    struct Fixture {
        context: SupervisorContext,
        factory: Arc<MockFactory>,
        configurator: Arc<RecordingConfigurator>,
    }

    fn fixture() -> Fixture {
        fixture_with(MockFactory::default())
    }

    fn fixture_with(factory: MockFactory) -> Fixture {
        let factory = Arc::new(factory);
        let configurator = Arc::new(RecordingConfigurator::default());
        let (relay, _) = broadcast::channel(16);
        let context = SupervisorContext {
            statistics: RtkStatistics::new(),
            registry: ConnectionRegistry::new(),
            factory: Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            configurator: Arc::clone(&configurator) as Arc<dyn SurveyConfigurator>,
            relay,
            survey_trigger: SurveyTrigger::new(),
            survey_settings: SharedSurveySettings::default(),
            id_format: "rtk:{}".to_string(),
            high_precision: true,
        };
        Fixture {
            context,
            factory,
            configurator,
        }
    }

    fn preset(id: &str, device: &str) -> SharedPreset {
        Arc::new(RtkPreset::new(
            id,
            id.to_uppercase(),
            vec![SourceSpec::serial(device, 115_200)],
            PresetFormat::Auto,
        ))
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

    #[tokio::test]
    async fn test_switch_publishes_current_preset() {
        let fx = fixture();
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        requests.send(Some(preset("base", "/dev/a"))).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current
                .wait_for(|p| p.as_ref().map(|p| p.id()) == Some("base"))
                .await
                .unwrap();
        })
        .await
        .unwrap();

        requests.send(None).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current.wait_for(|p| p.is_none()).await.unwrap();
        })
        .await
        .unwrap();

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_request_for_active_preset_is_noop() {
        let fx = fixture();
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        requests.send(Some(preset("base", "/dev/a"))).await.unwrap();
        // Same ID again, then a different preset to order the assertions.
        requests.send(Some(preset("base", "/dev/a"))).await.unwrap();
        requests.send(Some(preset("rover", "/dev/b"))).await.unwrap();

        timeout(Duration::from_secs(2), async {
            current
                .wait_for(|p| p.as_ref().map(|p| p.id()) == Some("rover"))
                .await
                .unwrap();
        })
        .await
        .unwrap();

        // "base" was connected once despite being requested twice.
        assert_eq!(fx.factory.connects.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_previous_tree_unwinds_before_next_starts() {
        let fx = fixture();
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        requests.send(Some(preset("a", "/dev/a"))).await.unwrap();
        requests.send(Some(preset("b", "/dev/b"))).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current
                .wait_for(|p| p.as_ref().map(|p| p.id()) == Some("b"))
                .await
                .unwrap();
        })
        .await
        .unwrap();

        let log = fx.factory.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "connect:serial:/dev/a?baud=115200",
                "drop:serial:/dev/a?baud=115200",
                "connect:serial:/dev/b?baud=115200",
            ]
        );

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_follows_activation() {
        let fx = fixture();
        let registry = fx.context.registry.clone();
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        requests.send(Some(preset("base", "/dev/a"))).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current.wait_for(|p| p.is_some()).await.unwrap();
        })
        .await
        .unwrap();
        wait_for(|| registry.len() == 1).await;
        let listed = registry.list();
        assert_eq!(listed[0].name, "rtk:base");
        assert_eq!(listed[0].purpose, "RTK corrections (BASE)");

        requests.send(None).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current.wait_for(|p| p.is_none()).await.unwrap();
        })
        .await
        .unwrap();
        wait_for(|| registry.is_empty()).await;

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_source_is_skipped() {
        let fx = fixture_with(MockFactory {
            failing: vec!["/dev/broken".to_string()],
            ..MockFactory::default()
        });
        let registry = fx.context.registry.clone();
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        let preset = Arc::new(RtkPreset::new(
            "mixed",
            "Mixed",
            vec![
                SourceSpec::serial("/dev/broken", 115_200),
                SourceSpec::serial("/dev/ok", 115_200),
            ],
            PresetFormat::Auto,
        ));
        requests.send(Some(preset)).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current
                .wait_for(|p| p.as_ref().map(|p| p.id()) == Some("mixed"))
                .await
                .unwrap();
        })
        .await
        .unwrap();

        // The preset stays active with the surviving source only.
        wait_for(|| registry.len() == 1).await;
        assert_eq!(fx.factory.connects.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_survey_arms_trigger_on_activation() {
        let fx = fixture();
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        let preset = Arc::new(
            RtkPreset::new(
                "survey-base",
                "Survey base",
                vec![SourceSpec::serial("/dev/a", 115_200)],
                PresetFormat::Ubx,
            )
            .with_auto_survey(true),
        );
        requests.send(Some(preset)).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current.wait_for(|p| p.is_some()).await.unwrap();
        })
        .await
        .unwrap();

        let configurator = Arc::clone(&fx.configurator);
        wait_for(move || !configurator.requests.lock().unwrap().is_empty()).await;
        let recorded = fx.configurator.requests.lock().unwrap().clone();
        assert_eq!(recorded[0].settings, SurveySettings::default());
        assert!(recorded[0].high_precision);

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_survey_starts_without_restart_delay() {
        struct NotifyingConfigurator {
            calls: mpsc::UnboundedSender<()>,
        }

        impl SurveyConfigurator for NotifyingConfigurator {
            fn configure<'a>(
                &'a self,
                _connection: &'a dyn RtkConnection,
                _request: &'a SurveyRequest,
            ) -> BoxFuture<'a, Result<(), SurveyError>> {
                Box::pin(async move {
                    let _ = self.calls.send(());
                    Ok(())
                })
            }
        }

        let mut fx = fixture();
        let (calls_tx, mut calls) = mpsc::unbounded_channel();
        fx.context.configurator = Arc::new(NotifyingConfigurator { calls: calls_tx });
        let (switcher, requests, _current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        let started = tokio::time::Instant::now();
        let preset = Arc::new(
            RtkPreset::new(
                "survey-base",
                "Survey base",
                vec![SourceSpec::serial("/dev/a", 115_200)],
                PresetFormat::Ubx,
            )
            .with_auto_survey(true),
        );
        requests.send(Some(preset)).await.unwrap();
        timeout(Duration::from_secs(2), calls.recv())
            .await
            .unwrap()
            .unwrap();

        // The paused clock only moves while a timer is awaited, so any
        // grace sleep on the activation path would show up here. The
        // restart grace applies between surveys, never before the first.
        assert!(started.elapsed() < tree::SURVEY_RESTART_GRACE);

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_switching_away_cancels_running_survey() {
        struct StallingConfigurator {
            started: AtomicUsize,
        }

        impl SurveyConfigurator for StallingConfigurator {
            fn configure<'a>(
                &'a self,
                _connection: &'a dyn RtkConnection,
                _request: &'a SurveyRequest,
            ) -> BoxFuture<'a, Result<(), SurveyError>> {
                Box::pin(async {
                    self.started.fetch_add(1, Ordering::SeqCst);
                    futures::future::pending().await
                })
            }
        }

        let mut fx = fixture();
        let stalling = Arc::new(StallingConfigurator {
            started: AtomicUsize::new(0),
        });
        fx.context.configurator = Arc::clone(&stalling) as Arc<dyn SurveyConfigurator>;
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        let preset = Arc::new(
            RtkPreset::new(
                "survey-base",
                "Survey base",
                vec![SourceSpec::serial("/dev/a", 115_200)],
                PresetFormat::Ubx,
            )
            .with_auto_survey(true),
        );
        requests.send(Some(preset)).await.unwrap();
        let stalled = Arc::clone(&stalling);
        wait_for(move || stalled.started.load(Ordering::SeqCst) == 1).await;

        // Deactivation must complete even though the survey never will.
        requests.send(None).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current.wait_for(|p| p.is_none()).await.unwrap();
        })
        .await
        .unwrap();

        shutdown.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_survey_restart_uses_latest_settings() {
        let fx = fixture();
        let (switcher, requests, mut current) = PresetSwitcher::new(fx.context.clone());
        let shutdown = CancellationToken::new();
        let daemon = tokio::spawn(switcher.run(shutdown.clone()));

        requests.send(Some(preset("base", "/dev/a"))).await.unwrap();
        timeout(Duration::from_secs(2), async {
            current.wait_for(|p| p.is_some()).await.unwrap();
        })
        .await
        .unwrap();

        fx.context.survey_settings.set(SurveySettings {
            accuracy: 0.5,
            duration: 120.0,
        });
        fx.context.survey_trigger.raise();
        let configurator = Arc::clone(&fx.configurator);
        wait_for(move || configurator.requests.lock().unwrap().len() == 1).await;

        fx.context.survey_settings.set(SurveySettings {
            accuracy: 0.25,
            duration: 240.0,
        });
        fx.context.survey_trigger.raise();
        let configurator = Arc::clone(&fx.configurator);
        wait_for(move || configurator.requests.lock().unwrap().len() == 2).await;

        let recorded = fx.configurator.requests.lock().unwrap().clone();
        assert_eq!(recorded[0].settings.accuracy, 0.5);
        assert_eq!(recorded[1].settings.accuracy, 0.25);
        assert_eq!(recorded[1].settings.duration, 240.0);

        shutdown.cancel();
        daemon.await.unwrap();
    }
}
