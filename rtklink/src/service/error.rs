//! Errors surfaced through the service handle.

use thiserror::Error;

use crate::survey::SurveyError;

/// Errors from control operations on a running service.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The requested preset is not in the catalog.
    #[error("no such preset: {0}")]
    UnknownPreset(String),

    /// Survey parameters failed validation.
    #[error(transparent)]
    Survey(#[from] SurveyError),
}
