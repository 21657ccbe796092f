//! Survey-in control for base station receivers.
//!
//! A survey-in asks the receiver to average its position until a target
//! accuracy is reached, then switch to broadcasting corrections from the
//! fixed position. This module holds the shared settings, the trigger flag
//! that requests a (re)start, and the [`SurveyConfigurator`] seam through
//! which receiver-specific configuration is written.
//!
//! Survey execution itself runs as a cancellable sub-task of the preset
//! supervision tree; see the supervisor module. Raising the trigger while a
//! survey is running cancels and restarts it, so the latest settings always
//! win.

use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::connection::{ConnectionError, RtkConnection};

mod ubx;

pub use ubx::UbxSurveyConfigurator;

// ============================================================================
// Settings
// ============================================================================

/// Survey-in parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurveySettings {
    /// Desired positional accuracy in meters.
    pub accuracy: f64,
    /// Minimum observation time in seconds.
    pub duration: f64,
}

impl Default for SurveySettings {
    fn default() -> Self {
        Self {
            accuracy: 1.0,
            duration: 60.0,
        }
    }
}

impl SurveySettings {
    /// Accuracy in whole centimeters, as reported in logs.
    pub fn accuracy_cm(&self) -> u32 {
        (self.accuracy * 100.0) as u32
    }
}

/// Settings cell shared between the service handle and the supervisor.
///
/// Writes are last-write-wins; a survey started after a write observes it.
#[derive(Debug, Clone, Default)]
pub struct SharedSurveySettings {
    inner: Arc<RwLock<SurveySettings>>,
}

impl SharedSurveySettings {
    pub fn new(settings: SurveySettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn get(&self) -> SurveySettings {
        *self.inner.read().unwrap()
    }

    pub fn set(&self, settings: SurveySettings) {
        *self.inner.write().unwrap() = settings;
    }
}

/// Partial settings update carried by a survey request.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SurveyParams {
    pub accuracy: Option<f64>,
    pub duration: Option<f64>,
}

impl SurveyParams {
    /// Validates the provided fields and merges them onto `current`.
    pub fn apply_to(&self, current: SurveySettings) -> Result<SurveySettings, SurveyError> {
        let mut next = current;
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy <= 0.0 {
                return Err(SurveyError::InvalidAccuracy);
            }
            next.accuracy = accuracy;
        }
        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(SurveyError::InvalidDuration);
            }
            next.duration = duration;
        }
        Ok(next)
    }
}

// ============================================================================
// Trigger
// ============================================================================

/// Level-triggered flag requesting a survey (re)start.
///
/// The supervisor waits on the flag, clears it, and starts a survey task.
/// Raising it again while a survey runs cancels that survey first. The flag
/// is also pre-armed during preset activation when the preset asks for an
/// automatic survey.
#[derive(Debug, Clone)]
pub struct SurveyTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SurveyTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl SurveyTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn set(&self, raised: bool) {
        self.tx.send_replace(raised);
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised. Does not clear it.
    pub async fn raised(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Frozen parameters of one survey execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurveyRequest {
    pub settings: SurveySettings,
    /// Ask the receiver for high precision output where supported.
    pub high_precision: bool,
}

/// Writes receiver-specific survey configuration over a connection.
pub trait SurveyConfigurator: Send + Sync {
    fn configure<'a>(
        &'a self,
        connection: &'a dyn RtkConnection,
        request: &'a SurveyRequest,
    ) -> BoxFuture<'a, Result<(), SurveyError>>;
}

/// Errors from survey validation and configuration.
#[derive(Debug, Error)]
pub enum SurveyError {
    #[error("invalid accuracy")]
    InvalidAccuracy,

    #[error("invalid duration")]
    InvalidDuration,

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Body of one survey sub-task.
///
/// Waits for the target connection to come up, then hands off to the
/// configurator. Failures are logged, not propagated; the stream keeps
/// relaying either way.
pub(crate) async fn run_survey(
    preset_title: &str,
    connection: Arc<dyn RtkConnection>,
    configurator: Arc<dyn SurveyConfigurator>,
    request: SurveyRequest,
) {
    info!(
        preset = %preset_title,
        duration_secs = request.settings.duration,
        accuracy_cm = request.settings.accuracy_cm(),
        "Starting survey"
    );
    if let Err(error) = connection.wait_until_connected().await {
        warn!(preset = %preset_title, error = %error, "Survey aborted; connection closed");
        return;
    }
    match configurator.configure(connection.as_ref(), &request).await {
        Ok(()) => info!(preset = %preset_title, "Survey configuration sent"),
        Err(error) => {
            warn!(preset = %preset_title, error = %error, "Survey configuration failed")
        }
    }
}
