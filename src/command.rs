//! Outbound command encoding
//!
//! The instrument accepts two kinds of commands on the wire:
//!
//! - Setpoints: `S<integer>\n`, an absolute DAC value in raw counts.
//! - Range toggles: a single ASCII byte with no terminator. `V`/`v`
//!   switch the voltage range, `C`/`c` the current range, uppercase
//!   meaning the high range is enabled.
//!
//! The DAC accepts values up to [`DAC_CEILING`]. A larger setpoint is
//! divided by [`HIGH_RANGE_DIVISOR`] (integer truncation) and flagged so
//! the caller switches the instrument into the high current range, where
//! the hardware multiplies the command back up. Callers issue the
//! setpoint first, then the toggle when the required range differs from
//! the commanded one, then update their range mirror.

/// Largest value the instrument DAC accepts directly
pub const DAC_CEILING: i32 = 4096;

/// Divisor applied to setpoints that exceed the DAC ceiling
pub const HIGH_RANGE_DIVISOR: i32 = 100;

/// A setpoint ready to go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetpointCommand {
    /// Wire text, `S<integer>` with a trailing newline
    pub text: String,
    /// The value carried in the wire text
    pub wire_value: i32,
    /// True when the setpoint requires the high current range
    pub high_current: bool,
}

/// Which range a toggle byte addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeToggle {
    /// The voltage measurement range
    Voltage,
    /// The current drive range
    Current,
}

/// Encode an absolute setpoint in raw counts
pub fn encode_setpoint(raw: i32) -> SetpointCommand {
    let (wire_value, high_current) = if raw > DAC_CEILING {
        (raw / HIGH_RANGE_DIVISOR, true)
    } else {
        (raw, false)
    };

    SetpointCommand {
        text: format!("S{}\n", wire_value),
        wire_value,
        high_current,
    }
}

/// Encode a range toggle byte
pub fn encode_mode_toggle(toggle: RangeToggle, enabled: bool) -> u8 {
    match (toggle, enabled) {
        (RangeToggle::Voltage, true) => b'V',
        (RangeToggle::Voltage, false) => b'v',
        (RangeToggle::Current, true) => b'C',
        (RangeToggle::Current, false) => b'c',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_low_range_setpoint() {
        let cmd = encode_setpoint(1000);
        assert_eq!(cmd.text, "S1000\n");
        assert_eq!(cmd.wire_value, 1000);
        assert!(!cmd.high_current);
    }

    #[test]
    fn test_encode_at_ceiling_stays_low_range() {
        let cmd = encode_setpoint(DAC_CEILING);
        assert_eq!(cmd.wire_value, 4096);
        assert!(!cmd.high_current);
    }

    #[test]
    fn test_encode_above_ceiling_divides_truncating() {
        let cmd = encode_setpoint(4097);
        assert_eq!(cmd.wire_value, 40);
        assert_eq!(cmd.text, "S40\n");
        assert!(cmd.high_current);

        let cmd = encode_setpoint(100_000);
        assert_eq!(cmd.wire_value, 1000);
        assert!(cmd.high_current);
    }

    #[test]
    fn test_encode_zero_setpoint() {
        let cmd = encode_setpoint(0);
        assert_eq!(cmd.text, "S0\n");
        assert!(!cmd.high_current);
    }

    #[test]
    fn test_setpoint_text_is_newline_terminated() {
        assert!(encode_setpoint(123).text.ends_with('\n'));
        assert!(encode_setpoint(9999).text.ends_with('\n'));
    }

    #[test]
    fn test_mode_toggle_bytes() {
        assert_eq!(encode_mode_toggle(RangeToggle::Voltage, true), b'V');
        assert_eq!(encode_mode_toggle(RangeToggle::Voltage, false), b'v');
        assert_eq!(encode_mode_toggle(RangeToggle::Current, true), b'C');
        assert_eq!(encode_mode_toggle(RangeToggle::Current, false), b'c');
    }
}
