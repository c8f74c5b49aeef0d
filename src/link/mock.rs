//! Mock instrument for testing without hardware
//!
//! This module simulates the curve tracer firmware behind the
//! [`InstrumentLink`] trait: it accepts the same setpoint and range-toggle
//! commands the real instrument does, models the device under test as a
//! resistive load, and synthesizes five-field telemetry frames on each poll.
//!
//! # Model
//!
//! - The commanded setpoint becomes the frame's `set` field verbatim.
//! - The drop voltage follows Ohm's law through a configurable load
//!   resistance, reported in the raw units of the active voltage range.
//! - The measured current tracks the setpoint with optional multiplicative
//!   jitter.
//! - The frame's range flags mirror the commanded range toggles.
//!
//! # Enabling
//!
//! The mock instrument is only available when the `mock-instrument` feature
//! is enabled:
//!
//! ```bash
//! cargo run --features mock-instrument -- --mock monitor
//! ```

use crate::error::{IvBenchError, Result};
use crate::link::{InstrumentLink, LinkStats};
use std::time::Instant;

/// Default simulated load in ohms (1 V drop at 100 uA)
const DEFAULT_LOAD_OHMS: f64 = 10_000.0;

/// Default frames synthesized per poll
const DEFAULT_FRAMES_PER_POLL: usize = 2;

/// Simple pseudo-random number generator (no external dependency)
fn rand_simple() -> f64 {
    use std::cell::Cell;
    thread_local! {
        static SEED: Cell<u64> = Cell::new(12345);
    }
    SEED.with(|seed| {
        let mut s = seed.get();
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        seed.set(s);
        (s as f64) / (u64::MAX as f64)
    })
}

/// Mock curve tracer for testing without real hardware
pub struct MockInstrument {
    /// Whether the mock link is "open"
    open: bool,
    /// Last setpoint received over the wire, in the active range's units
    commanded_raw: i32,
    /// High voltage range commanded by the host
    high_voltage: bool,
    /// High current range commanded by the host
    high_current: bool,
    /// Simulated load resistance in ohms
    load_ohms: f64,
    /// Multiplicative jitter applied to the measured current (0.0 = exact)
    noise_fraction: f64,
    /// Frames synthesized per poll
    frames_per_poll: usize,
    /// Link statistics
    stats: LinkStats,
}

impl MockInstrument {
    /// Create a closed mock instrument with default settings
    pub fn new() -> Self {
        Self {
            open: false,
            commanded_raw: 0,
            high_voltage: false,
            high_current: false,
            load_ohms: DEFAULT_LOAD_OHMS,
            noise_fraction: 0.0,
            frames_per_poll: DEFAULT_FRAMES_PER_POLL,
            stats: LinkStats::default(),
        }
    }

    /// Set the simulated load resistance
    pub fn with_load_ohms(mut self, ohms: f64) -> Self {
        self.load_ohms = ohms;
        self
    }

    /// Add multiplicative jitter to the measured current
    pub fn with_noise(mut self, fraction: f64) -> Self {
        self.noise_fraction = fraction;
        self
    }

    /// Set how many frames each poll synthesizes
    pub fn with_frames_per_poll(mut self, frames: usize) -> Self {
        self.frames_per_poll = frames;
        self
    }

    /// Last setpoint the host commanded, in the active range's raw units
    pub fn commanded_raw(&self) -> i32 {
        self.commanded_raw
    }

    /// High voltage range state as commanded by the host
    pub fn high_voltage(&self) -> bool {
        self.high_voltage
    }

    /// High current range state as commanded by the host
    pub fn high_current(&self) -> bool {
        self.high_current
    }

    /// Synthesize one telemetry frame from the commanded state
    fn synthesize_frame(&self) -> String {
        let current_gain = if self.high_current { 100.0 } else { 1.0 };
        let voltage_gain = if self.high_voltage { 10.0 } else { 1.0 };

        let set_ua = self.commanded_raw as f64 * current_gain / 10.0;
        let drop_v = set_ua * self.load_ohms * 1e-6;

        let jitter = 1.0 + (rand_simple() - 0.5) * 2.0 * self.noise_fraction;
        let measured_ua = set_ua * jitter;

        let drop_raw = (drop_v * 1000.0 / voltage_gain).round() as i32;
        let current_raw = (measured_ua * 10.0 / current_gain).round() as i32;

        format!(
            "{};{};{};{};{}",
            self.commanded_raw,
            drop_raw,
            current_raw,
            self.high_voltage as i32,
            self.high_current as i32
        )
    }

    /// Apply one host command to the simulated firmware state
    fn apply_command(&mut self, bytes: &[u8]) {
        match bytes.first() {
            Some(b'S') => {
                let text = String::from_utf8_lossy(&bytes[1..]);
                match text.trim().parse::<i32>() {
                    Ok(value) => self.commanded_raw = value,
                    Err(_) => {
                        tracing::debug!(command = %text.trim(), "Mock ignored unparseable setpoint")
                    }
                }
            }
            Some(b'V') => self.high_voltage = true,
            Some(b'v') => self.high_voltage = false,
            Some(b'C') => self.high_current = true,
            Some(b'c') => self.high_current = false,
            _ => tracing::debug!(len = bytes.len(), "Mock ignored unknown command"),
        }
    }
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentLink for MockInstrument {
    fn open(&mut self, _port: Option<&str>) -> Result<()> {
        self.open = true;
        self.commanded_raw = 0;
        self.high_voltage = false;
        self.high_current = false;
        tracing::info!("Mock instrument opened");
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            tracing::info!("Mock instrument closed");
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn port_name(&self) -> Option<&str> {
        Some("mock0")
    }

    fn poll_lines(&mut self) -> Result<Vec<String>> {
        if !self.open {
            return Err(IvBenchError::LinkClosed);
        }

        let now = Instant::now();
        let mut lines = Vec::with_capacity(self.frames_per_poll);
        for _ in 0..self.frames_per_poll {
            let line = self.synthesize_frame();
            self.stats.record_read(line.len() as u64 + 1);
            self.stats.record_line(now);
            lines.push(line);
        }
        Ok(lines)
    }

    fn write_command(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            self.stats.record_write_failure();
            return Err(IvBenchError::LinkClosed);
        }

        self.apply_command(bytes);
        self.stats.record_write_success();
        Ok(())
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut LinkStats {
        &mut self.stats
    }
}
