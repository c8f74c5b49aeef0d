//! Engine worker thread
//!
//! [`EngineWorker`] owns the [`BenchSession`] and runs the acquisition
//! loop on a dedicated thread: drain pending commands, drain telemetry,
//! drive the sweep timer, publish events. The frontend talks to it only
//! through the channel pair created by [`super::BenchEngine::new`].

use super::session::BenchSession;
use super::{EngineCommand, EngineEvent};
use crate::config::BenchProfile;
#[cfg(feature = "mock-instrument")]
use crate::link::MockInstrument;
use crate::link::SerialLink;
use crate::sweep::SweepConfig;
use crate::types::{LinkStatus, RangeState};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker that owns the instrument session
pub struct EngineWorker {
    /// Profile the engine was started with
    profile: BenchProfile,
    /// Commands from the frontend
    command_rx: Receiver<EngineCommand>,
    /// Events to the frontend
    event_tx: Sender<EngineEvent>,
    /// Shared shutdown flag
    running: Arc<AtomicBool>,
    /// Session around the instrument link
    session: BenchSession,
    /// Whether the session currently holds a mock link
    #[cfg(feature = "mock-instrument")]
    mock_link: bool,
    /// Last published link status, gates the acquisition path
    link_status: LinkStatus,
    /// Loop period in milliseconds
    poll_interval_ms: u64,
    /// Start of the current loop iteration
    last_loop_time: Instant,
    /// Last time statistics were published
    last_stats_time: Instant,
}

impl EngineWorker {
    /// Create a worker around a serial link built from the profile
    pub fn new(
        profile: BenchProfile,
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let link = SerialLink::new(profile.link.clone());
        let session = BenchSession::new(&profile, Box::new(link));
        let poll_interval_ms = profile.engine.poll_interval_ms;

        Self {
            profile,
            command_rx,
            event_tx,
            running,
            session,
            #[cfg(feature = "mock-instrument")]
            mock_link: false,
            link_status: LinkStatus::Closed,
            poll_interval_ms,
            last_loop_time: Instant::now(),
            last_stats_time: Instant::now(),
        }
    }

    /// Main worker loop, runs until the shutdown flag clears
    pub fn run(mut self) {
        tracing::info!("Engine worker started");

        while self.running.load(Ordering::Relaxed) {
            self.process_commands();

            if self.link_status == LinkStatus::Open {
                self.poll_telemetry();
                self.drive_sweep();

                let stats_interval =
                    Duration::from_millis(self.profile.engine.stats_interval_ms);
                if self.last_stats_time.elapsed() >= stats_interval {
                    self.send_stats();
                    self.last_stats_time = Instant::now();
                }
            }

            self.rate_limit();
        }

        if let Some(outcome) = self.session.close_link() {
            self.try_send_event(EngineEvent::SweepFinished(outcome));
        }
        let _ = self.event_tx.send(EngineEvent::Shutdown);
        tracing::info!("Engine worker stopped");
    }

    /// Drain all pending commands without blocking
    fn process_commands(&mut self) {
        loop {
            match self.command_rx.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("Command channel disconnected, shutting down");
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    /// Dispatch a single command
    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::OpenLink { port } => self.handle_open(port),
            EngineCommand::CloseLink => self.handle_close(),
            EngineCommand::SetCurrent(raw) => {
                let before = self.session.range();
                let result = self.session.set_current(raw);
                self.report_write(before, result);
            }
            EngineCommand::Nudge(delta) => {
                let before = self.session.range();
                let result = self.session.nudge(delta);
                self.report_write(before, result);
            }
            EngineCommand::SetHighVoltage(enabled) => {
                let before = self.session.range();
                let result = self.session.set_high_voltage(enabled);
                self.report_write(before, result);
            }
            EngineCommand::SetHighCurrent(enabled) => {
                let before = self.session.range();
                let result = self.session.set_high_current(enabled);
                self.report_write(before, result);
            }
            EngineCommand::StartSweep(config) => self.handle_start_sweep(config),
            EngineCommand::StopSweep => {
                if let Some(outcome) = self.session.stop_sweep() {
                    tracing::info!(termination = %outcome.termination, "Sweep stopped");
                    self.try_send_event(EngineEvent::SweepFinished(outcome));
                }
            }
            EngineCommand::ClearHistory => self.session.clear_history(),
            EngineCommand::SetPollInterval(interval_ms) => {
                self.poll_interval_ms = interval_ms.max(1);
                tracing::debug!(
                    poll_interval_ms = self.poll_interval_ms,
                    "Poll interval changed"
                );
            }
            EngineCommand::RequestStats => self.send_stats(),
            EngineCommand::Shutdown => {
                tracing::info!("Shutdown command received");
                self.running.store(false, Ordering::Relaxed);
            }
            #[cfg(feature = "mock-instrument")]
            EngineCommand::UseMockInstrument(use_mock) => self.handle_use_mock(use_mock),
        }
    }

    fn handle_open(&mut self, port: Option<String>) {
        self.update_link_status(LinkStatus::Opening);

        match self.session.open_link(port.as_deref()) {
            Ok(()) => {
                tracing::info!(port = ?self.session.port_name(), "Link opened");
                self.update_link_status(LinkStatus::Open);
            }
            Err(e) => {
                tracing::error!("Failed to open link: {}", e);
                self.update_link_status(LinkStatus::Error);
                self.try_send_event(EngineEvent::LinkError(e.to_string()));
            }
        }
    }

    fn handle_close(&mut self) {
        if let Some(outcome) = self.session.close_link() {
            self.try_send_event(EngineEvent::SweepFinished(outcome));
        }
        self.update_link_status(LinkStatus::Closed);
        tracing::info!("Link closed");
    }

    fn handle_start_sweep(&mut self, config: SweepConfig) {
        match self.session.start_sweep(config, Instant::now()) {
            Ok(outcome) => {
                tracing::info!(
                    start = config.start,
                    end = config.end,
                    step = config.step,
                    interval_ms = config.interval_ms,
                    "Sweep started"
                );
                self.try_send_event(EngineEvent::SweepStarted { config });
                if let Some(outcome) = outcome {
                    self.try_send_event(EngineEvent::SweepFinished(outcome));
                }
            }
            Err(e) => {
                tracing::warn!("Sweep rejected: {}", e);
                self.try_send_event(EngineEvent::SweepError(e.to_string()));
            }
        }
    }

    #[cfg(feature = "mock-instrument")]
    fn handle_use_mock(&mut self, use_mock: bool) {
        if use_mock == self.mock_link {
            return;
        }

        let link: Box<dyn crate::link::InstrumentLink> = if use_mock {
            Box::new(MockInstrument::new())
        } else {
            Box::new(SerialLink::new(self.profile.link.clone()))
        };
        if let Some(outcome) = self.session.replace_link(link) {
            self.try_send_event(EngineEvent::SweepFinished(outcome));
        }
        self.mock_link = use_mock;
        self.update_link_status(LinkStatus::Closed);
        tracing::info!(mock = use_mock, "Instrument link swapped");
    }

    /// Publish the result of a manual instrument write
    fn report_write(&mut self, before: RangeState, result: crate::error::Result<()>) {
        match result {
            Ok(()) => {
                let after = self.session.range();
                if after != before {
                    self.try_send_event(EngineEvent::RangeChanged(after));
                }
            }
            Err(e) => {
                tracing::warn!("Instrument write failed: {}", e);
                self.try_send_event(EngineEvent::LinkError(e.to_string()));
            }
        }
    }

    /// Drain the link and publish each decoded sample
    fn poll_telemetry(&mut self) {
        match self.session.poll_telemetry() {
            Ok(samples) => {
                for sample in samples {
                    self.try_send_event(EngineEvent::Sample(sample));
                }
            }
            Err(e) => {
                tracing::warn!("Telemetry poll failed: {}", e);
                self.try_send_event(EngineEvent::LinkError(e.to_string()));
            }
        }
    }

    /// Step the sweep when its timer has lapsed
    fn drive_sweep(&mut self) {
        let now = Instant::now();
        if !self.session.sweep_tick_due(now) {
            return;
        }
        if let Some(outcome) = self.session.sweep_tick(now) {
            tracing::info!(
                termination = %outcome.termination,
                captured = outcome.captured,
                "Sweep finished"
            );
            self.try_send_event(EngineEvent::SweepFinished(outcome));
        }
    }

    /// Sleep out the remainder of the loop period
    fn rate_limit(&mut self) {
        let target = Duration::from_millis(self.poll_interval_ms.max(1));
        let elapsed = self.last_loop_time.elapsed();
        if elapsed < target {
            std::thread::sleep(target - elapsed);
        }
        self.last_loop_time = Instant::now();
    }

    fn update_link_status(&mut self, status: LinkStatus) {
        self.link_status = status;
        self.try_send_event(EngineEvent::LinkStatus(status));
    }

    fn send_stats(&mut self) {
        let stats = self.session.stats().clone();
        self.try_send_event(EngineEvent::Stats(stats));
    }

    /// Send an event without blocking, counting it as dropped on a full
    /// channel
    fn try_send_event(&mut self, event: EngineEvent) {
        if self.event_tx.try_send(event).is_err() {
            self.session.stats_mut().dropped_events += 1;
        }
    }
}
