//! InstrumentLink trait for the unified transport interface
//!
//! This module provides a common trait for instrument transports, enabling
//! both the real serial link and a mock instrument for testing without
//! hardware.

pub mod serial;

#[cfg(feature = "mock-instrument")]
pub mod mock;

pub use serial::{list_ports, SerialLink};

#[cfg(feature = "mock-instrument")]
pub use mock::MockInstrument;

use crate::error::{IvBenchError, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// Size of the rolling window of recent line arrival times
const RECENT_WINDOW_SIZE: usize = 100;

/// Longest line the assembler will buffer before discarding it unterminated
pub const MAX_LINE_LEN: usize = 512;

/// Pause between attempts while waiting for the link guard
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Statistics for link operations
///
/// Tracks byte and line throughput plus command write outcomes for a
/// transport.
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// Total bytes read from the instrument
    pub bytes_read: u64,
    /// Total complete lines received
    pub lines_received: u64,
    /// Total commands written successfully
    pub writes_issued: u64,
    /// Total command writes that failed
    pub write_failures: u64,
    /// Rolling window of recent line arrival times for rate calculation
    pub recent_line_times: VecDeque<Instant>,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            bytes_read: 0,
            lines_received: 0,
            writes_issued: 0,
            write_failures: 0,
            recent_line_times: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl LinkStats {
    /// Record bytes arriving from the instrument
    pub fn record_read(&mut self, bytes: u64) {
        self.bytes_read += bytes;
    }

    /// Record a complete line arriving at `now`
    pub fn record_line(&mut self, now: Instant) {
        self.lines_received += 1;
        self.recent_line_times.push_back(now);
        if self.recent_line_times.len() > RECENT_WINDOW_SIZE {
            self.recent_line_times.pop_front();
        }
    }

    /// Record a successful command write
    pub fn record_write_success(&mut self) {
        self.writes_issued += 1;
    }

    /// Record a failed command write
    pub fn record_write_failure(&mut self) {
        self.write_failures += 1;
    }

    /// Calculate write success rate as percentage
    pub fn write_success_rate(&self) -> f64 {
        let total = self.writes_issued + self.write_failures;
        if total == 0 {
            100.0
        } else {
            (self.writes_issued as f64 / total as f64) * 100.0
        }
    }

    /// Calculate the line arrival rate over the recent window in Hz
    pub fn line_rate_hz(&self) -> f64 {
        if self.recent_line_times.len() < 2 {
            return 0.0;
        }
        let first = self.recent_line_times.front().copied();
        let last = self.recent_line_times.back().copied();
        match (first, last) {
            (Some(first), Some(last)) => {
                let span = last.duration_since(first).as_secs_f64();
                if span <= 0.0 {
                    0.0
                } else {
                    (self.recent_line_times.len() - 1) as f64 / span
                }
            }
            _ => 0.0,
        }
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Assembles a byte stream into complete lines
///
/// Lines terminate on `\r` or `\n`, so CRLF terminators still yield a single
/// line. Empty lines are dropped. A line that outgrows [`MAX_LINE_LEN`]
/// without a terminator is discarded.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self {
            partial: String::new(),
        }
    }

    /// Feed raw bytes, appending any completed lines to `lines`
    pub fn push_bytes(&mut self, bytes: &[u8], lines: &mut Vec<String>) {
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                if !self.partial.is_empty() {
                    lines.push(std::mem::take(&mut self.partial));
                }
            } else if byte.is_ascii() && !byte.is_ascii_control() {
                self.partial.push(byte as char);
                if self.partial.len() > MAX_LINE_LEN {
                    self.partial.clear();
                }
            }
        }
    }

    /// Number of buffered bytes still waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }

    /// Drop any buffered partial line
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

/// Acquire `mutex` within `timeout`, retrying with short sleeps
///
/// Returns [`IvBenchError::LinkBusy`] when the guard could not be taken
/// before the deadline.
pub fn lock_timed<T>(mutex: &Mutex<T>, timeout: Duration) -> Result<MutexGuard<'_, T>> {
    let deadline = Instant::now() + timeout;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => {
                return Err(IvBenchError::Channel("link lock poisoned".to_string()))
            }
            Err(TryLockError::WouldBlock) => {}
        }
        if Instant::now() >= deadline {
            return Err(IvBenchError::LinkBusy {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        std::thread::sleep(LOCK_RETRY_INTERVAL);
    }
}

/// Unified interface for instrument transports
///
/// This trait covers both the real serial link and the mock instrument so
/// the engine can drive either through the same object. Implementations
/// must be `Send` to allow ownership by the engine worker thread.
///
/// # Example
///
/// ```ignore
/// fn drain(link: &mut dyn InstrumentLink) -> Result<Vec<String>> {
///     link.poll_lines()
/// }
/// ```
pub trait InstrumentLink: Send {
    /// Open the transport and complete the instrument's boot handshake
    ///
    /// A `port` argument overrides the configured port name for this and
    /// later opens.
    fn open(&mut self, port: Option<&str>) -> Result<()>;

    /// Close the transport, dropping any partially assembled input
    fn close(&mut self);

    /// Check whether the transport is open
    fn is_open(&self) -> bool;

    /// Name of the underlying port, when one is configured
    fn port_name(&self) -> Option<&str>;

    /// Collect every complete line received since the last poll
    ///
    /// Returns an empty vector when nothing has arrived. Partial lines stay
    /// buffered until their terminator shows up.
    fn poll_lines(&mut self) -> Result<Vec<String>>;

    /// Write a raw command to the instrument
    fn write_command(&mut self, bytes: &[u8]) -> Result<()>;

    /// Get link operation statistics
    fn stats(&self) -> &LinkStats;

    /// Get mutable reference to link statistics
    fn stats_mut(&mut self) -> &mut LinkStats;

    /// Reset link statistics
    fn reset_stats(&mut self) {
        self.stats_mut().reset();
    }
}

/// Information about a detected serial port (for listing)
#[derive(Debug, Clone)]
pub enum DetectedPort {
    /// A USB serial adapter
    Usb {
        /// Device path or COM name
        name: String,
        /// Vendor ID
        vendor_id: u16,
        /// Product ID
        product_id: u16,
        /// Product string (if available)
        product: Option<String>,
        /// Serial number (if available)
        serial_number: Option<String>,
    },
    /// A non-USB port
    Other {
        /// Device path or COM name
        name: String,
        /// Port kind reported by the OS
        kind: String,
    },
}

impl DetectedPort {
    /// Device path or COM name of this port
    pub fn name(&self) -> &str {
        match self {
            DetectedPort::Usb { name, .. } => name,
            DetectedPort::Other { name, .. } => name,
        }
    }

    /// Get a display-friendly name for this port
    pub fn display_name(&self) -> String {
        match self {
            DetectedPort::Usb {
                name,
                vendor_id,
                product_id,
                product,
                ..
            } => {
                if let Some(ref product) = product {
                    format!("{} ({:04x}:{:04x}) - {}", name, vendor_id, product_id, product)
                } else {
                    format!("{} ({:04x}:{:04x})", name, vendor_id, product_id)
                }
            }
            DetectedPort::Other { name, kind } => format!("{} ({})", name, kind),
        }
    }
}

impl std::fmt::Display for DetectedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
