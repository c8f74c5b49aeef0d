//! Configuration module for the IvBench engine
//!
//! This module handles the persisted bench profile: the serial link
//! parameters, the calibration offset, default sweep settings, and the
//! engine tuning knobs.
//!
//! # Profile Location
//!
//! The profile is stored in the platform-appropriate config location:
//! - **Linux**: `~/.config/ivbench/profile.toml`
//! - **macOS**: `~/Library/Application Support/ivbench/profile.toml`
//! - **Windows**: `%APPDATA%\ivbench\profile.toml`
//!
//! All fields default individually, so a partial profile file loads with
//! the missing tables filled in.
//!
//! # Example
//!
//! ```ignore
//! use ivbench::config::BenchProfile;
//!
//! let mut profile = BenchProfile::load_or_default();
//! profile.link.port = Some("/dev/ttyUSB0".to_string());
//! profile.save()?;
//! ```

use crate::error::{IvBenchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "ivbench";

/// Profile filename
pub const PROFILE_FILE: &str = "profile.toml";

/// Default serial baud rate the instrument firmware runs at
pub const DEFAULT_BAUD_RATE: u32 = 38_400;

/// Default read timeout while waiting for the boot banner, in milliseconds
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 5_000;

/// Default steady-state read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 50;

/// Default bounded wait for the link guard in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3_000;

/// Number of boot banner lines the instrument prints after reset
pub const BOOT_BANNER_LINES: usize = 2;

/// Default sweep tick interval in milliseconds
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 200;

/// Default engine poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default interval between stats events in milliseconds
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 500;

/// Consecutive setpoint write failures tolerated before a sweep aborts
pub const DEFAULT_WRITE_FAILURE_LIMIT: u32 = 3;

/// Default command channel capacity
pub const DEFAULT_COMMAND_BUFFER: usize = 256;

/// Default event channel capacity
pub const DEFAULT_EVENT_BUFFER: usize = 10_000;

// ==================== Config Directory ====================

/// Get the profile directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the profile directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir()
        .ok_or_else(|| IvBenchError::Config("Could not determine config directory".to_string()))?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            IvBenchError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the profile file
pub fn profile_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(PROFILE_FILE))
}

// ==================== Link Config ====================

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Port to open (e.g. "/dev/ttyUSB0" or "COM3"); None means pick at runtime
    #[serde(default)]
    pub port: Option<String>,

    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Read timeout while waiting for the boot banner, in milliseconds
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Steady-state read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Bounded wait for exclusive link access, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_open_timeout_ms() -> u64 {
    DEFAULT_OPEN_TIMEOUT_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

// ==================== Calibration Config ====================

/// Calibration configuration
///
/// The offset is a count added to each raw measurement field before range
/// scaling. It is determined once per instrument and stays fixed while
/// the engine runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalibrationConfig {
    /// Raw counts added to every measurement field
    #[serde(default)]
    pub offset: i32,
}

// ==================== Sweep Defaults ====================

/// Default sweep parameters, in raw setpoint counts (tenths of a microamp)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepDefaults {
    /// Sweep start setpoint
    #[serde(default)]
    pub start: i32,

    /// Sweep end setpoint
    #[serde(default = "default_sweep_end")]
    pub end: i32,

    /// Setpoint increment per tick
    #[serde(default = "default_sweep_step")]
    pub step: i32,

    /// Tick interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
}

fn default_sweep_end() -> i32 {
    1000
}

fn default_sweep_step() -> i32 {
    10
}

fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

impl Default for SweepDefaults {
    fn default() -> Self {
        Self {
            start: 0,
            end: 1000,
            step: 10,
            interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

// ==================== Engine Tuning ====================

/// Engine worker tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Telemetry poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between stats events in milliseconds
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,

    /// Consecutive write failures tolerated before a sweep aborts
    #[serde(default = "default_write_failure_limit")]
    pub write_failure_limit: u32,

    /// Command channel capacity
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,

    /// Event channel capacity
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Samples retained per history channel
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_stats_interval_ms() -> u64 {
    DEFAULT_STATS_INTERVAL_MS
}

fn default_write_failure_limit() -> u32 {
    DEFAULT_WRITE_FAILURE_LIMIT
}

fn default_command_buffer() -> usize {
    DEFAULT_COMMAND_BUFFER
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_history_capacity() -> usize {
    crate::types::HISTORY_CAPACITY
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
            write_failure_limit: DEFAULT_WRITE_FAILURE_LIMIT,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            history_capacity: crate::types::HISTORY_CAPACITY,
        }
    }
}

// ==================== Bench Profile ====================

/// Persistent bench profile
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BenchProfile {
    /// Serial link configuration
    #[serde(default)]
    pub link: LinkConfig,

    /// Calibration configuration
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Default sweep parameters
    #[serde(default)]
    pub sweep: SweepDefaults,

    /// Engine worker tuning
    #[serde(default)]
    pub engine: EngineTuning,
}

impl BenchProfile {
    /// Load the profile from the default location
    pub fn load() -> Result<Self> {
        let path = profile_path()
            .ok_or_else(|| IvBenchError::Config("Could not determine profile path".to_string()))?;
        Self::load_from(path)
    }

    /// Load a profile from an explicit path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            IvBenchError::Config(format!("Failed to read profile {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            IvBenchError::Config(format!("Failed to parse profile {:?}: {}", path, e))
        })
    }

    /// Load the profile, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load profile, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the profile to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_config_dir()?;
        self.save_to(dir.join(PROFILE_FILE))
    }

    /// Save the profile to an explicit path
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IvBenchError::Config(format!("Failed to create profile directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| IvBenchError::Config(format!("Failed to serialize profile: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            IvBenchError::Config(format!("Failed to write profile {:?}: {}", path, e))
        })
    }
}

// ==================== Tests ====================
