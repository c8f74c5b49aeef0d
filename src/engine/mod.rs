//! Acquisition engine
//!
//! The engine drives the instrument from a dedicated worker thread and
//! exchanges data with the frontend through a pair of crossbeam channels,
//! so a slow consumer never stalls acquisition.
//!
//! # Architecture
//!
//! ```text
//! frontend (CLI, UI)
//!     | EngineCommand          ^ EngineEvent
//!     v                        |
//! EngineWorker (worker thread)
//!     |
//!     v
//! BenchSession -> InstrumentLink (serial or mock)
//! ```
//!
//! # Components
//!
//! - [`BenchEngine`] builds the channel pair and runs the worker
//! - [`EngineHandle`] is the frontend's endpoint
//! - [`EngineWorker`] owns the [`BenchSession`] and the poll loop
//!
//! # Example
//!
//! ```ignore
//! use ivbench::config::BenchProfile;
//! use ivbench::engine::{BenchEngine, EngineEvent};
//!
//! let (engine, handle) = BenchEngine::new(BenchProfile::default());
//! std::thread::spawn(move || engine.run());
//!
//! handle.open_link(None);
//! for event in handle.drain() {
//!     if let EngineEvent::Sample(sample) = event {
//!         println!("{:.3} uA", sample.corrected_current_ua);
//!     }
//! }
//! ```

pub mod session;
pub mod worker;

pub use session::BenchSession;
pub use worker::EngineWorker;

use crate::config::BenchProfile;
use crate::sweep::{SweepConfig, SweepOutcome};
use crate::types::{EngineStats, LinkStatus, RangeState, ScaledSample};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Commands the frontend sends to the engine
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Open the instrument link, optionally overriding the configured port
    OpenLink { port: Option<String> },
    /// Close the instrument link
    CloseLink,
    /// Issue a current setpoint in raw counts
    SetCurrent(i32),
    /// Adjust the setpoint relative to the last one issued
    Nudge(i32),
    /// Command the voltage range
    SetHighVoltage(bool),
    /// Command the current range
    SetHighCurrent(bool),
    /// Start a sweep
    StartSweep(SweepConfig),
    /// Stop the running sweep
    StopSweep,
    /// Clear the sample history and statistics
    ClearHistory,
    /// Change the worker loop period in milliseconds
    SetPollInterval(u64),
    /// Ask for a statistics event immediately
    RequestStats,
    /// Stop the worker thread
    Shutdown,
    /// Swap between the mock and the serial instrument
    #[cfg(feature = "mock-instrument")]
    UseMockInstrument(bool),
}

/// Events the engine publishes to the frontend
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The link status changed
    LinkStatus(LinkStatus),
    /// A link operation failed
    LinkError(String),
    /// A telemetry sample arrived
    Sample(ScaledSample),
    /// The commanded range state changed
    RangeChanged(RangeState),
    /// A sweep entered the running phase
    SweepStarted { config: SweepConfig },
    /// A sweep could not start
    SweepError(String),
    /// A sweep left the running phase
    SweepFinished(SweepOutcome),
    /// Engine statistics snapshot
    Stats(EngineStats),
    /// The worker thread exited
    Shutdown,
}

/// Frontend endpoint of the engine channel pair
pub struct EngineHandle {
    receiver: Receiver<EngineEvent>,
    command_sender: Sender<EngineCommand>,
}

impl EngineHandle {
    /// Receive one event without blocking
    pub fn try_recv(&self) -> Option<EngineEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain all pending events
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Send a command, returning false when the worker is gone
    pub fn send_command(&self, command: EngineCommand) -> bool {
        self.command_sender.send(command).is_ok()
    }

    /// Open the instrument link
    pub fn open_link(&self, port: Option<String>) {
        let _ = self.command_sender.send(EngineCommand::OpenLink { port });
    }

    /// Close the instrument link
    pub fn close_link(&self) {
        let _ = self.command_sender.send(EngineCommand::CloseLink);
    }

    /// Issue a current setpoint in raw counts
    pub fn set_current(&self, raw: i32) {
        let _ = self.command_sender.send(EngineCommand::SetCurrent(raw));
    }

    /// Adjust the setpoint relative to the last one issued
    pub fn nudge(&self, delta: i32) {
        let _ = self.command_sender.send(EngineCommand::Nudge(delta));
    }

    /// Command the voltage range
    pub fn set_high_voltage(&self, enabled: bool) {
        let _ = self
            .command_sender
            .send(EngineCommand::SetHighVoltage(enabled));
    }

    /// Command the current range
    pub fn set_high_current(&self, enabled: bool) {
        let _ = self
            .command_sender
            .send(EngineCommand::SetHighCurrent(enabled));
    }

    /// Start a sweep
    pub fn start_sweep(&self, config: SweepConfig) {
        let _ = self.command_sender.send(EngineCommand::StartSweep(config));
    }

    /// Stop the running sweep
    pub fn stop_sweep(&self) {
        let _ = self.command_sender.send(EngineCommand::StopSweep);
    }

    /// Clear the sample history and statistics
    pub fn clear_history(&self) {
        let _ = self.command_sender.send(EngineCommand::ClearHistory);
    }

    /// Change the worker loop period in milliseconds
    pub fn set_poll_interval(&self, interval_ms: u64) {
        let _ = self
            .command_sender
            .send(EngineCommand::SetPollInterval(interval_ms));
    }

    /// Ask for a statistics event immediately
    pub fn request_stats(&self) {
        let _ = self.command_sender.send(EngineCommand::RequestStats);
    }

    /// Stop the worker thread
    pub fn shutdown(&self) {
        let _ = self.command_sender.send(EngineCommand::Shutdown);
    }

    /// Swap between the mock and the serial instrument
    #[cfg(feature = "mock-instrument")]
    pub fn use_mock_instrument(&self, use_mock: bool) {
        let _ = self
            .command_sender
            .send(EngineCommand::UseMockInstrument(use_mock));
    }
}

/// The acquisition engine
pub struct BenchEngine {
    profile: BenchProfile,
    command_receiver: Receiver<EngineCommand>,
    event_sender: Sender<EngineEvent>,
    running: Arc<AtomicBool>,
}

impl BenchEngine {
    /// Create the engine and the frontend handle it pairs with
    pub fn new(profile: BenchProfile) -> (Self, EngineHandle) {
        // Commands are few; the event side carries the telemetry stream
        // and gets the deep buffer before samples start dropping.
        let (command_sender, command_receiver) = bounded(profile.engine.command_buffer);
        let (event_sender, event_receiver) = bounded(profile.engine.event_buffer);

        let engine = Self {
            profile,
            command_receiver,
            event_sender,
            running: Arc::new(AtomicBool::new(true)),
        };
        let handle = EngineHandle {
            receiver: event_receiver,
            command_sender,
        };
        (engine, handle)
    }

    /// Flag that stops the worker loop when cleared
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run the worker loop on the calling thread
    pub fn run(self) {
        let worker = EngineWorker::new(
            self.profile,
            self.command_receiver,
            self.event_sender,
            self.running,
        );
        worker.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_engine_creation() {
        let (engine, handle) = BenchEngine::new(BenchProfile::default());

        assert!(engine.stop_handle().load(Ordering::Relaxed));
        assert!(handle.send_command(EngineCommand::RequestStats));
    }

    #[test]
    fn test_handle_commands_reach_the_worker_queue() {
        let (engine, handle) = BenchEngine::new(BenchProfile::default());

        handle.open_link(None);
        handle.set_current(100);
        handle.stop_sweep();
        handle.shutdown();

        let mut received = Vec::new();
        while let Ok(command) = engine.command_receiver.try_recv() {
            received.push(command);
        }
        assert_eq!(received.len(), 4);
        assert!(matches!(received[0], EngineCommand::OpenLink { .. }));
        assert!(matches!(received[3], EngineCommand::Shutdown));
    }

    #[test]
    fn test_try_recv_on_empty_queue() {
        let (_engine, handle) = BenchEngine::new(BenchProfile::default());

        assert!(handle.try_recv().is_none());
        assert!(handle.drain().is_empty());
    }
}
