//! Last-known telemetry values from the connected trainer.

use crate::protocol::bike_data::BikeData;

/// The latest telemetry values known to the engine.
///
/// Fields are updated independently: a notification that carries only power
/// leaves cadence and heart rate untouched, and a field stays `None` until the
/// peripheral has reported it at least once. Absent data is indistinguishable
/// from data dropped as malformed; the decoders never surface parse errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySample {
    /// Instantaneous power in watts. Signed; some trainers report negative
    /// values while freewheeling.
    pub power: Option<i32>,
    /// Instantaneous cadence in rpm.
    pub cadence: Option<u32>,
    /// Heart rate in bpm.
    pub heart_rate: Option<u32>,
}

impl TelemetrySample {
    /// Merges a decoded Indoor Bike Data update into the sample.
    ///
    /// Only fields present in the update are overwritten.
    pub fn apply_bike_data(&mut self, data: &BikeData) {
        if let Some(cadence) = data.cadence_rpm {
            self.cadence = Some(cadence);
        }
        if let Some(power) = data.power_watts {
            self.power = Some(power);
        }
    }

    /// Merges a decoded heart rate measurement into the sample.
    pub fn apply_heart_rate(&mut self, bpm: u32) {
        self.heart_rate = Some(bpm);
    }
}
