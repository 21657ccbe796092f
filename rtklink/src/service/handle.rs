//! Cloneable control handle for a running service.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

use super::ControlError;
use crate::connection::{ConnectionRegistry, RegisteredConnection};
use crate::discovery::{HotplugEvent, SharedLastRequest};
use crate::preset::{PresetCatalog, PresetInfo};
use crate::statistics::{RtkStatistics, StatisticsSnapshot};
use crate::supervisor::{RelayedPacket, SwitchRequest};
use crate::survey::{SharedSurveySettings, SurveyParams, SurveySettings, SurveyTrigger};

/// Control surface of a running RTK service.
///
/// Handles are cheap to clone and safe to use from any task. Selection is
/// asynchronous by design: [`select_source`](RtkHandle::select_source)
/// returns once the request is queued, and the switch completes in the
/// background. Observe [`active_source`](RtkHandle::active_source) to see it
/// land.
#[derive(Clone)]
pub struct RtkHandle {
    pub(super) catalog: Arc<PresetCatalog>,
    pub(super) switch_requests: mpsc::Sender<SwitchRequest>,
    pub(super) current: watch::Receiver<SwitchRequest>,
    pub(super) statistics: RtkStatistics,
    pub(super) registry: ConnectionRegistry,
    pub(super) relay: broadcast::Sender<RelayedPacket>,
    pub(super) survey_settings: SharedSurveySettings,
    pub(super) survey_trigger: SurveyTrigger,
    pub(super) last_request: SharedLastRequest,
    pub(super) hotplug: mpsc::Sender<HotplugEvent>,
}

impl RtkHandle {
    /// IDs of all selectable presets, sorted.
    pub fn source_ids(&self) -> Vec<String> {
        self.catalog.ids()
    }

    /// ID of the preset whose supervision tree is currently running.
    ///
    /// `None` while a switch is in flight: the old tree is torn down before
    /// the new preset is published.
    pub fn active_source(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|p| p.id().to_string())
    }

    /// Requests a switch to the named preset, or deactivation with `None`.
    ///
    /// The ID is validated against the catalog before queueing. An explicit
    /// selection is also remembered for the reconnection grace window; an
    /// explicit deactivation forgets it.
    pub async fn select_source(&self, id: Option<&str>) -> Result<(), ControlError> {
        let request = match id {
            Some(id) => {
                let preset = self
                    .catalog
                    .get(id)
                    .ok_or_else(|| ControlError::UnknownPreset(id.to_string()))?;
                self.last_request.record(id);
                Some(preset)
            }
            None => {
                self.last_request.clear();
                None
            }
        };
        if self.switch_requests.send(request).await.is_err() {
            warn!("Cannot request preset switch; the switcher is not running");
        }
        Ok(())
    }

    /// Public descriptions for the requested preset IDs; unknown IDs are
    /// omitted from the result.
    pub fn preset_info(&self, ids: &[&str]) -> Vec<PresetInfo> {
        self.catalog.describe(ids)
    }

    /// Current survey settings.
    pub fn survey_settings(&self) -> SurveySettings {
        self.survey_settings.get()
    }

    /// Validates and stores new survey parameters, then requests a survey
    /// (re)start.
    ///
    /// The request is level-triggered: if a survey is already running it is
    /// cancelled and restarted with the new settings. Without an active
    /// survey-capable preset the request stays armed until one activates,
    /// unless a later activation re-arms the trigger from its own
    /// auto-survey flag.
    pub fn start_survey(&self, params: SurveyParams) -> Result<(), ControlError> {
        let next = params.apply_to(self.survey_settings.get())?;
        self.survey_settings.set(next);
        self.survey_trigger.raise();
        Ok(())
    }

    /// Snapshot of the packet statistics of the active preset.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Connections currently held open by the active preset.
    pub fn connections(&self) -> Vec<RegisteredConnection> {
        self.registry.list()
    }

    /// Subscribes to the stream of forwarded correction packets.
    ///
    /// Slow subscribers lag rather than block the relay; a lagged receiver
    /// reports how many packets it missed.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayedPacket> {
        self.relay.subscribe()
    }

    /// Notifies the service that the set of serial ports may have changed.
    ///
    /// Cheap and non-blocking. Events are collapsed: if a reconcile is
    /// already pending, another notification is redundant and is dropped.
    pub fn notify_hotplug(&self) {
        let _ = self.hotplug.try_send(HotplugEvent);
    }
}
