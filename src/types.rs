//! Core data types for the IvBench engine
//!
//! This module contains the fundamental data structures used throughout
//! the crate for representing telemetry samples and their history.
//!
//! # Main Types
//!
//! - [`RawSample`] - One decoded telemetry frame, still in device counts
//! - [`ScaledSample`] - A frame after calibration and range scaling
//! - [`RangeState`] - The host-side mirror of the commanded DAC ranges
//! - [`RingBuffer`] - Fixed-capacity FIFO used for per-channel history
//! - [`SampleHistory`] - The four history channels plus the latest sample
//!
//! # History
//!
//! Each scaled sample fans out into four independent channels (drop
//! voltage, measured current, set current, current error), each capped at
//! [`HISTORY_CAPACITY`] entries. When a channel is full the oldest entry
//! is evicted automatically. Snapshots are ordered oldest first.
//!
//! # Statistics
//!
//! Channel statistics (min, max, average) are computed on demand from the
//! retained window; with a 256-entry cap this stays exact and cheap.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of samples retained per history channel
pub const HISTORY_CAPACITY: usize = 256;

/// One telemetry frame as decoded off the wire, in raw device counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Commanded setpoint echoed back by the instrument
    pub set_raw: i32,
    /// Voltage drop across the device under test
    pub drop_raw: i32,
    /// Measured current through the device under test
    pub current_raw: i32,
    /// True when the frame was captured in the high voltage range
    pub high_voltage: bool,
    /// True when the frame was captured in the high current range
    pub high_current: bool,
}

/// A telemetry frame after calibration offset and range scaling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaledSample {
    /// Commanded setpoint in microamps
    pub set_current_ua: f64,
    /// Voltage drop across the device under test in volts
    pub drop_voltage_v: f64,
    /// Measured current in microamps
    pub measured_current_ua: f64,
    /// Measured current with the drop-proportional leakage removed, never negative
    pub corrected_current_ua: f64,
    /// Measured minus commanded current in microamps
    pub current_error_ua: f64,
    /// Range flags carried over from the frame
    pub high_voltage: bool,
    /// Range flags carried over from the frame
    pub high_current: bool,
}

impl std::fmt::Display for ScaledSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "set {:.1} µA, drop {:.3} V, measured {:.1} µA, corrected {:.1} µA, error {:+.1} µA",
            self.set_current_ua,
            self.drop_voltage_v,
            self.measured_current_ua,
            self.corrected_current_ua,
            self.current_error_ua,
        )?;
        if self.high_voltage {
            write!(f, " [HV]")?;
        }
        if self.high_current {
            write!(f, " [HC]")?;
        }
        Ok(())
    }
}

/// Host-side mirror of the most recently commanded DAC ranges
///
/// This is the commanded state, updated after every issued toggle. The
/// flags inside a [`ScaledSample`] are the instrument's reported state
/// and may lag by a frame or two; scaling always uses the reported ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeState {
    /// High voltage range commanded
    pub high_voltage: bool,
    /// High current range commanded
    pub high_current: bool,
}

/// Identifies one of the four history channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Voltage drop across the device under test
    DropVoltage,
    /// Measured current
    MeasuredCurrent,
    /// Commanded current
    SetCurrent,
    /// Measured minus commanded current
    CurrentError,
}

impl ChannelKind {
    /// Get all channels in display order
    pub fn all() -> &'static [ChannelKind] {
        &[
            ChannelKind::DropVoltage,
            ChannelKind::MeasuredCurrent,
            ChannelKind::SetCurrent,
            ChannelKind::CurrentError,
        ]
    }

    /// Get the display name for this channel
    pub fn display_name(&self) -> &'static str {
        match self {
            ChannelKind::DropVoltage => "Drop voltage",
            ChannelKind::MeasuredCurrent => "Measured current",
            ChannelKind::SetCurrent => "Set current",
            ChannelKind::CurrentError => "Current error",
        }
    }

    /// Get the unit suffix for this channel
    pub fn unit(&self) -> &'static str {
        match self {
            ChannelKind::DropVoltage => "V",
            ChannelKind::MeasuredCurrent
            | ChannelKind::SetCurrent
            | ChannelKind::CurrentError => "µA",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Fixed-capacity FIFO that evicts the oldest element when full
///
/// Capacity must be nonzero and is fixed at construction.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty ring buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, evicting the oldest one if the buffer is full
    pub fn push(&mut self, value: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
    }

    /// Number of retained values
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check whether the buffer holds no values
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The fixed capacity set at construction
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recently appended value
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterate the retained values oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Remove all retained values, keeping the capacity
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy out the retained values ordered oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Rolling history of scaled samples, split into four channels
#[derive(Debug, Clone)]
pub struct SampleHistory {
    drop_voltage: RingBuffer<f64>,
    measured_current: RingBuffer<f64>,
    set_current: RingBuffer<f64>,
    current_error: RingBuffer<f64>,
    latest: Option<ScaledSample>,
}

impl SampleHistory {
    /// Create an empty history with the given per-channel capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            drop_voltage: RingBuffer::new(capacity),
            measured_current: RingBuffer::new(capacity),
            set_current: RingBuffer::new(capacity),
            current_error: RingBuffer::new(capacity),
            latest: None,
        }
    }

    /// Fan one scaled sample out to all four channels
    pub fn record(&mut self, sample: &ScaledSample) {
        self.drop_voltage.push(sample.drop_voltage_v);
        self.measured_current.push(sample.measured_current_ua);
        self.set_current.push(sample.set_current_ua);
        self.current_error.push(sample.current_error_ua);
        self.latest = Some(*sample);
    }

    /// The most recently recorded sample
    pub fn latest(&self) -> Option<&ScaledSample> {
        self.latest.as_ref()
    }

    /// Borrow one channel's ring buffer
    pub fn channel(&self, kind: ChannelKind) -> &RingBuffer<f64> {
        match kind {
            ChannelKind::DropVoltage => &self.drop_voltage,
            ChannelKind::MeasuredCurrent => &self.measured_current,
            ChannelKind::SetCurrent => &self.set_current,
            ChannelKind::CurrentError => &self.current_error,
        }
    }

    /// Copy out one channel's values ordered oldest first
    pub fn snapshot(&self, kind: ChannelKind) -> Vec<f64> {
        self.channel(kind).snapshot()
    }

    /// Number of samples retained (all channels advance together)
    pub fn len(&self) -> usize {
        self.drop_voltage.len()
    }

    /// Check whether no samples have been recorded since the last clear
    pub fn is_empty(&self) -> bool {
        self.drop_voltage.is_empty()
    }

    /// Get one channel's (min, max, average), or None when empty
    pub fn statistics(&self, kind: ChannelKind) -> Option<(f64, f64, f64)> {
        let channel = self.channel(kind);
        if channel.is_empty() {
            return None;
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for value in channel.iter() {
            min = min.min(*value);
            max = max.max(*value);
            sum += value;
        }
        Some((min, max, sum / channel.len() as f64))
    }

    /// Drop all retained samples and the latest-sample cache
    pub fn clear(&mut self) {
        self.drop_voltage.clear();
        self.measured_current.clear();
        self.set_current.clear();
        self.current_error.clear();
        self.latest = None;
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

/// Represents the state of the instrument link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    /// No port is open
    #[default]
    Closed,
    /// Attempting to open and sync with the instrument
    Opening,
    /// Open and streaming
    Open,
    /// The link failed and was torn down
    Error,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Closed => write!(f, "Closed"),
            LinkStatus::Opening => write!(f, "Opening..."),
            LinkStatus::Open => write!(f, "Open"),
            LinkStatus::Error => write!(f, "Error"),
        }
    }
}

/// Statistics about the engine's acquisition and command traffic
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of frames decoded successfully
    pub frames_decoded: u64,
    /// Number of lines rejected as malformed
    pub malformed_frames: u64,
    /// Number of setpoint commands issued
    pub setpoints_issued: u64,
    /// Number of failed command writes
    pub write_failures: u64,
    /// Number of sweeps run to an outcome
    pub sweeps_completed: u64,
    /// Number of events dropped due to queue backpressure
    pub dropped_events: u64,
    /// Total bytes read off the link
    pub bytes_read: u64,
    /// Current effective sample rate in Hz
    pub sample_rate_hz: f64,
}

impl EngineStats {
    /// Fraction of received lines that decoded cleanly, as a percentage
    pub fn decode_success_rate(&self) -> f64 {
        let total = self.frames_decoded + self.malformed_frames;
        if total == 0 {
            100.0
        } else {
            (self.frames_decoded as f64 / total as f64) * 100.0
        }
    }

    /// Fraction of issued commands that were written cleanly, as a percentage
    pub fn write_success_rate(&self) -> f64 {
        if self.setpoints_issued == 0 {
            100.0
        } else {
            let ok = self.setpoints_issued.saturating_sub(self.write_failures);
            (ok as f64 / self.setpoints_issued as f64) * 100.0
        }
    }
}
