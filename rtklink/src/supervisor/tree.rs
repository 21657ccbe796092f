//! The per-preset supervision tree.
//!
//! One task per activated preset. It opens the preset's sources in
//! declaration order, spawns a read loop per source, and then sits in the
//! survey trigger loop until cancelled. All children run under child tokens
//! of the tree token, so cancelling the tree stops everything; the tree
//! then joins its children before returning, which is what makes preset
//! teardown complete rather than fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RelayedPacket, SupervisorContext};
use crate::connection::{LinkEvent, RtkConnection};
use crate::preset::SharedPreset;
use crate::statistics::RtkStatistics;
use crate::survey::{run_survey, SurveyConfigurator, SurveyRequest};

/// Pause between cancelling a survey task and starting its replacement.
/// Gives the receiver a moment between conflicting configuration writes and
/// coalesces trigger bursts.
pub(super) const SURVEY_RESTART_GRACE: Duration = Duration::from_millis(100);

pub(super) async fn run_preset_tree(
    preset: SharedPreset,
    context: SupervisorContext,
    cancel: CancellationToken,
) {
    let _stats_scope = context.statistics.activate();

    let mut connections: Vec<Arc<dyn RtkConnection>> = Vec::new();
    let mut registrations = Vec::new();
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    let base_name = context.connection_name(preset.id());
    let purpose = format!("RTK corrections ({})", preset.title());

    for source in preset.sources() {
        match context.factory.connect(source) {
            Ok(connection) => {
                registrations.push(context.registry.register(
                    &base_name,
                    &purpose,
                    &source.to_string(),
                ));
                readers.push(tokio::spawn(run_source_reader(
                    Arc::clone(&preset),
                    Arc::clone(&connection),
                    context.statistics.clone(),
                    context.relay.clone(),
                    cancel.child_token(),
                )));
                connections.push(connection);
            }
            // One bad source must not take the preset down with it.
            Err(error) => {
                error!(
                    preset = %preset.title(),
                    source = %source,
                    error = %error,
                    "Failed to open source; continuing with the remaining sources"
                );
            }
        }
    }
    if connections.is_empty() && !preset.sources().is_empty() {
        warn!(preset = %preset.title(), "Preset is active but has no usable sources");
    }

    run_survey_loop(&preset, &context, &connections, &cancel).await;

    // The token is cancelled by now; wait for every child to unwind.
    join_all(readers).await;
    drop(registrations);
    debug!(preset = %preset.title(), "Preset supervision tree stopped");
}

/// Reads one source until cancelled, feeding packets to statistics and the
/// relay. The connection reconnects on its own; this loop only resets the
/// parser when the stream gaps, since framing state cannot span an outage.
async fn run_source_reader(
    preset: SharedPreset,
    connection: Arc<dyn RtkConnection>,
    statistics: RtkStatistics,
    relay: broadcast::Sender<RelayedPacket>,
    cancel: CancellationToken,
) {
    let mut parser = preset.create_parser();
    let encoder = preset.create_encoder();
    let mut seen_data = false;
    debug!(source = %connection.name(), "Source read loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = connection.recv() => event,
        };
        match event {
            Some(LinkEvent::Connected) => {
                info!(preset = %preset.title(), source = %connection.name(), "Source connected");
            }
            Some(LinkEvent::Data(chunk)) => {
                if !seen_data {
                    seen_data = true;
                    debug!(source = %connection.name(), bytes = chunk.len(), "First data from source");
                }
                for packet in parser.push(&chunk) {
                    statistics.notify(&packet);
                    if preset.accepts(&packet) {
                        statistics.notify_forwarded(&packet);
                        let relayed = RelayedPacket {
                            preset_id: preset.id().to_string(),
                            payload: encoder.encode(&packet),
                        };
                        // No subscribers is not an error.
                        let _ = relay.send(relayed);
                    }
                }
            }
            Some(LinkEvent::Disconnected) => {
                warn!(
                    preset = %preset.title(),
                    source = %connection.name(),
                    "Source disconnected; waiting for it to come back"
                );
                parser = preset.create_parser();
            }
            None => {
                warn!(source = %connection.name(), "Source closed");
                break;
            }
        }
    }
    debug!(source = %connection.name(), "Source read loop stopped");
}

/// Waits on the survey trigger and manages the single survey sub-task.
///
/// Raising the trigger cancels any running survey, waits a short grace
/// interval, and starts a new one against the preset's first source with
/// the settings current at that moment. Presets that cannot survey, or
/// that ended up with no connections, consume the trigger silently.
async fn run_survey_loop(
    preset: &SharedPreset,
    context: &SupervisorContext,
    connections: &[Arc<dyn RtkConnection>],
    cancel: &CancellationToken,
) {
    let mut survey: Option<(CancellationToken, JoinHandle<()>)> = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = context.survey_trigger.raised() => {}
        }
        context.survey_trigger.clear();

        if let Some((token, handle)) = survey.take() {
            token.cancel();
            let _ = handle.await;
            // The grace applies between surveys only; a first survey
            // starts immediately.
            let restart = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(SURVEY_RESTART_GRACE) => true,
            };
            if !restart {
                break;
            }
        }

        if !preset.survey_capable() {
            debug!(preset = %preset.title(), "Survey requested but the preset format does not support it");
            continue;
        }
        let Some(target) = connections.first() else {
            debug!(preset = %preset.title(), "Survey requested but the preset has no connections");
            continue;
        };

        let request = SurveyRequest {
            settings: context.survey_settings.get(),
            high_precision: context.high_precision,
        };
        let token = cancel.child_token();
        let handle = tokio::spawn(survey_task(
            preset.title().to_string(),
            Arc::clone(target),
            Arc::clone(&context.configurator),
            request,
            token.clone(),
        ));
        survey = Some((token, handle));
    }
    if let Some((token, handle)) = survey.take() {
        token.cancel();
        let _ = handle.await;
    }
}

async fn survey_task(
    title: String,
    connection: Arc<dyn RtkConnection>,
    configurator: Arc<dyn SurveyConfigurator>,
    request: SurveyRequest,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(preset = %title, "Survey cancelled");
        }
        _ = run_survey(&title, connection, configurator, request) => {}
    }
}
