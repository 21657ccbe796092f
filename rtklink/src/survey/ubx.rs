//! Survey-in configuration for u-blox receivers via UBX CFG-VALSET.

use std::time::Duration;

use futures::future::BoxFuture;

use super::{SurveyConfigurator, SurveyError, SurveyRequest};
use crate::connection::RtkConnection;
use crate::packet::ubx_frame;

const UBX_CLASS_CFG: u8 = 0x06;
const UBX_ID_VALSET: u8 = 0x8A;

// Configuration keys from the u-blox interface description.
const KEY_TMODE_MODE: u32 = 0x2003_0001;
const KEY_TMODE_SVIN_MIN_DUR: u32 = 0x4003_0010;
const KEY_TMODE_SVIN_ACC_LIMIT: u32 = 0x4003_0011;
const KEY_NMEA_HIGHPREC: u32 = 0x1093_0006;

const TMODE_DISABLED: u8 = 0;
const TMODE_SURVEY_IN: u8 = 1;

/// Default pause between configuration frames, giving the receiver time to
/// apply each one.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Writes survey-in configuration to u-blox F9-class receivers.
///
/// The receiver is first taken out of time mode so that re-running a survey
/// restarts the averaging from scratch, then survey-in is enabled with the
/// requested duration and accuracy limit.
#[derive(Debug, Clone)]
pub struct UbxSurveyConfigurator {
    settle_delay: Duration,
}

impl Default for UbxSurveyConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl UbxSurveyConfigurator {
    pub fn new() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }
}

impl SurveyConfigurator for UbxSurveyConfigurator {
    fn configure<'a>(
        &'a self,
        connection: &'a dyn RtkConnection,
        request: &'a SurveyRequest,
    ) -> BoxFuture<'a, Result<(), SurveyError>> {
        Box::pin(async move {
            for frame in valset_frames(request) {
                connection.send(frame).await?;
                tokio::time::sleep(self.settle_delay).await;
            }
            Ok(())
        })
    }
}

/// The CFG-VALSET frames for one survey request, in send order.
fn valset_frames(request: &SurveyRequest) -> Vec<Vec<u8>> {
    let duration_secs = (request.settings.duration.round() as u32).max(1);
    // SVIN_ACC_LIMIT is in 0.1 mm units.
    let accuracy_limit = ((request.settings.accuracy * 10_000.0).round() as u32).max(1);

    let mut frames = vec![
        ValSet::new().push_u8(KEY_TMODE_MODE, TMODE_DISABLED).frame(),
        ValSet::new()
            .push_u32(KEY_TMODE_SVIN_MIN_DUR, duration_secs)
            .push_u32(KEY_TMODE_SVIN_ACC_LIMIT, accuracy_limit)
            .push_u8(KEY_TMODE_MODE, TMODE_SURVEY_IN)
            .frame(),
    ];
    if request.high_precision {
        frames.push(ValSet::new().push_u8(KEY_NMEA_HIGHPREC, 1).frame());
    }
    frames
}

/// CFG-VALSET payload builder; writes to the RAM layer only.
struct ValSet {
    payload: Vec<u8>,
}

impl ValSet {
    fn new() -> Self {
        // version, layer = RAM, reserved.
        Self {
            payload: vec![0x00, 0x01, 0x00, 0x00],
        }
    }

    fn push_u8(mut self, key: u32, value: u8) -> Self {
        self.payload.extend_from_slice(&key.to_le_bytes());
        self.payload.push(value);
        self
    }

    fn push_u32(mut self, key: u32, value: u32) -> Self {
        self.payload.extend_from_slice(&key.to_le_bytes());
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn frame(self) -> Vec<u8> {
        ubx_frame(UBX_CLASS_CFG, UBX_ID_VALSET, &self.payload)
    }
}
