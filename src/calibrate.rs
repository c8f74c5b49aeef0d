//! Calibration and range scaling
//!
//! Raw frames arrive in device counts. One count is a tenth of a
//! microamp on the current channels and a millivolt on the voltage
//! channel, and the high ranges multiply the hardware gain by 100
//! (current) or 10 (voltage). [`CalibrationScaler`] folds the static
//! calibration offset and the range gains into engineering units.
//!
//! The corrected current subtracts the drop voltage from the measured
//! current, one microamp per volt. That is the instrument's empirical
//! model of its own input-stage leakage, kept exactly as the hardware
//! was characterised. A frame can never correct below zero current.

use crate::types::{RawSample, ScaledSample};

/// Raw counts per microamp on the current channels, low range
pub const CURRENT_SCALE_DIVISOR: f64 = 10.0;

/// Raw counts per volt on the voltage channel, low range
pub const VOLTAGE_SCALE_DIVISOR: f64 = 1000.0;

/// Gain multiplier applied by the high current range
pub const HIGH_CURRENT_GAIN: f64 = 100.0;

/// Gain multiplier applied by the high voltage range
pub const HIGH_VOLTAGE_GAIN: f64 = 10.0;

/// Converts raw frames into scaled samples
///
/// Holds the static calibration offset for the instrument. The offset is
/// added to every raw field before the range gains apply, so one bench
/// profile describes the instrument in both ranges.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationScaler {
    offset: i32,
}

impl CalibrationScaler {
    /// Create a scaler with the given calibration offset in raw counts
    pub fn new(offset: i32) -> Self {
        Self { offset }
    }

    /// The configured offset in raw counts
    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Scale one raw frame into engineering units
    ///
    /// The range gains come from the frame's own flags: the instrument
    /// reports which range each frame was captured in, and that report
    /// wins over whatever the host last commanded.
    pub fn scale(&self, raw: &RawSample) -> ScaledSample {
        let current_gain = if raw.high_current {
            HIGH_CURRENT_GAIN
        } else {
            1.0
        };
        let voltage_gain = if raw.high_voltage {
            HIGH_VOLTAGE_GAIN
        } else {
            1.0
        };

        let set_current_ua =
            (raw.set_raw + self.offset) as f64 * current_gain / CURRENT_SCALE_DIVISOR;
        let measured_current_ua =
            (raw.current_raw + self.offset) as f64 * current_gain / CURRENT_SCALE_DIVISOR;
        let drop_voltage_v =
            (raw.drop_raw + self.offset) as f64 * voltage_gain / VOLTAGE_SCALE_DIVISOR;

        // One microamp of input-stage leakage per volt of drop
        let corrected_current_ua = (measured_current_ua - drop_voltage_v).max(0.0);
        let current_error_ua = measured_current_ua - set_current_ua;

        ScaledSample {
            set_current_ua,
            drop_voltage_v,
            measured_current_ua,
            corrected_current_ua,
            current_error_ua,
            high_voltage: raw.high_voltage,
            high_current: raw.high_current,
        }
    }
}
