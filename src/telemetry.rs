//! Telemetry frame decoding
//!
//! The instrument streams one ASCII line per measurement:
//!
//! ```text
//! setRaw;dropRaw;currentRaw;highVoltageFlag;highCurrentFlag\n
//! ```
//!
//! All five fields are decimal integers. The three measurement fields are
//! raw device counts; the two flags report which range the frame was
//! captured in. Anything else is rejected as a malformed frame so one
//! corrupted line never stops the stream.

use crate::error::{IvBenchError, Result};
use crate::types::RawSample;

/// Number of fields in a telemetry frame
pub const FRAME_FIELD_COUNT: usize = 5;

/// Field separator within a frame
pub const FRAME_SEPARATOR: char = ';';

/// Decode one telemetry line into a [`RawSample`]
///
/// The line may carry surrounding whitespace (a trailing `\r` from CRLF
/// firmware builds is common). A field count other than five, or any
/// field that is not a decimal integer, is a malformed frame.
pub fn decode_line(line: &str) -> Result<RawSample> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(IvBenchError::MalformedFrame(line.to_string()));
    }

    let fields: Vec<&str> = trimmed.split(FRAME_SEPARATOR).collect();
    if fields.len() != FRAME_FIELD_COUNT {
        return Err(IvBenchError::MalformedFrame(trimmed.to_string()));
    }

    let mut values = [0i32; FRAME_FIELD_COUNT];
    for (slot, field) in values.iter_mut().zip(fields.iter()) {
        *slot = field
            .trim()
            .parse::<i32>()
            .map_err(|_| IvBenchError::MalformedFrame(trimmed.to_string()))?;
    }

    Ok(RawSample {
        set_raw: values[0],
        drop_raw: values[1],
        current_raw: values[2],
        high_voltage: values[3] != 0,
        high_current: values[4] != 0,
    })
}
