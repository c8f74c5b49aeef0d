//! # IVBench: Bench Curve-Tracer Automation
//!
//! Telemetry decoding, calibration, and sweep automation for a serial
//! bench curve tracer. The architecture separates the serial polling
//! engine from the frontend that consumes its events, so acquisition
//! keeps running while the UI or CLI does its own work.
//!
//! ## Architecture
//!
//! - **Link**: Serial transport and line framing via serialport
//! - **Engine**: Polls telemetry and drives sweeps in a worker thread
//! - **Sweep**: Timer-driven setpoint stepping with curve aggregation
//! - **Communication**: Crossbeam channels for thread-safe data transfer
//!
//! ## Configuration
//!
//! The bench profile is stored in the platform-appropriate data directory
//! under `ivbench`:
//!
//! - **Linux**: `~/.local/share/ivbench/`
//! - **macOS**: `~/Library/Application Support/ivbench/`
//! - **Windows**: `%APPDATA%\ivbench\`
//!
//! ## Example
//!
//! ```ignore
//! use ivbench::{
//!     config::BenchProfile,
//!     engine::{BenchEngine, EngineEvent},
//!     sweep::SweepConfig,
//! };
//!
//! fn main() {
//!     let profile = BenchProfile::load_or_default();
//!     let (engine, handle) = BenchEngine::new(profile);
//!
//!     std::thread::spawn(move || engine.run());
//!
//!     handle.open_link(None);
//!     handle.start_sweep(SweepConfig {
//!         start: 0,
//!         end: 1000,
//!         step: 10,
//!         interval_ms: 200,
//!     });
//!
//!     loop {
//!         for event in handle.drain() {
//!             if let EngineEvent::SweepFinished(outcome) = event {
//!                 println!("captured {} points", outcome.captured);
//!                 return;
//!             }
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(50));
//!     }
//! }
//! ```

pub mod aggregate;
pub mod calibrate;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod sweep;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use aggregate::{AggregatedCurve, CurveBin};
pub use calibrate::CalibrationScaler;
pub use config::BenchProfile;
pub use engine::{BenchEngine, EngineCommand, EngineEvent, EngineHandle};
pub use error::{IvBenchError, Result};
pub use sweep::{SweepConfig, SweepOutcome, SweepTermination};
pub use types::{ChannelKind, RangeState, RawSample, ScaledSample};
