//! Instrument session owned by the engine worker
//!
//! [`BenchSession`] holds everything attached to one link: the calibration
//! scaler, the commanded range state, the rolling sample history, and the
//! sweep state machine. Every method runs on the worker thread, so the
//! session itself is single threaded; concurrency stays at the channel
//! boundary one layer up.

use crate::aggregate::AggregatedCurve;
use crate::calibrate::CalibrationScaler;
use crate::command::{encode_mode_toggle, encode_setpoint, RangeToggle};
use crate::config::BenchProfile;
use crate::error::{IvBenchError, Result};
use crate::link::InstrumentLink;
use crate::sweep::{SweepConfig, SweepController, SweepOutcome, SweepPhase, TickOutcome};
use crate::telemetry::decode_line;
use crate::types::{ChannelKind, EngineStats, RangeState, SampleHistory, ScaledSample};
use std::time::Instant;

/// State for one instrument link
pub struct BenchSession {
    /// Transport to the instrument
    link: Box<dyn InstrumentLink>,
    /// Raw-count to physical-unit scaler
    scaler: CalibrationScaler,
    /// Range state as commanded over the wire
    range: RangeState,
    /// Rolling per-channel sample history
    history: SampleHistory,
    /// Sweep state machine
    sweep: SweepController,
    /// Last setpoint issued, in raw counts
    last_setpoint: i32,
    /// Acquisition and command statistics
    stats: EngineStats,
}

impl BenchSession {
    /// Create a session around the given transport
    pub fn new(profile: &BenchProfile, link: Box<dyn InstrumentLink>) -> Self {
        Self {
            link,
            scaler: CalibrationScaler::new(profile.calibration.offset),
            range: RangeState::default(),
            history: SampleHistory::new(profile.engine.history_capacity),
            sweep: SweepController::new(profile.engine.write_failure_limit),
            last_setpoint: 0,
            stats: EngineStats::default(),
        }
    }

    /// Swap the transport, closing the old one first
    ///
    /// Returns the outcome of a sweep that had to stop for the swap.
    pub fn replace_link(&mut self, link: Box<dyn InstrumentLink>) -> Option<SweepOutcome> {
        let outcome = self.close_link();
        self.link = link;
        outcome
    }

    /// Open the link, optionally overriding the configured port
    pub fn open_link(&mut self, port: Option<&str>) -> Result<()> {
        self.link.open(port)?;
        // Opening resets the instrument, which boots in the low ranges
        // with a zero setpoint.
        self.range = RangeState::default();
        self.last_setpoint = 0;
        Ok(())
    }

    /// Close the link, stopping any sweep in flight
    ///
    /// Returns the outcome of a sweep that had to stop for the close.
    pub fn close_link(&mut self) -> Option<SweepOutcome> {
        let outcome = self.stop_sweep();
        self.link.close();
        outcome
    }

    /// Check whether the link is open
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Name of the underlying port, when one is configured
    pub fn port_name(&self) -> Option<&str> {
        self.link.port_name()
    }

    /// Issue a current setpoint in raw counts
    ///
    /// Encodes the value for the wire, writes it, and follows up with a
    /// current-range toggle when the encoding crossed a range boundary.
    /// Setpoint first; the firmware rescales whatever setpoint it holds
    /// when the range toggles.
    pub fn set_current(&mut self, raw: i32) -> Result<()> {
        let command = encode_setpoint(raw);

        self.stats.setpoints_issued += 1;
        if let Err(e) = self.link.write_command(command.text.as_bytes()) {
            self.stats.write_failures += 1;
            return Err(e.with_context(format!("Failed to issue setpoint {}", raw)));
        }
        self.last_setpoint = raw;

        if command.high_current != self.range.high_current {
            let toggle = encode_mode_toggle(RangeToggle::Current, command.high_current);
            if let Err(e) = self.link.write_command(&[toggle]) {
                self.stats.write_failures += 1;
                return Err(e.with_context("Failed to toggle current range"));
            }
            self.range.high_current = command.high_current;
            tracing::debug!(
                high_current = command.high_current,
                "Current range switched"
            );
        }
        Ok(())
    }

    /// Adjust the setpoint relative to the last one issued
    pub fn nudge(&mut self, delta: i32) -> Result<()> {
        self.set_current(self.last_setpoint.saturating_add(delta))
    }

    /// Command the voltage range directly
    pub fn set_high_voltage(&mut self, enabled: bool) -> Result<()> {
        let toggle = encode_mode_toggle(RangeToggle::Voltage, enabled);
        if let Err(e) = self.link.write_command(&[toggle]) {
            self.stats.write_failures += 1;
            return Err(e.with_context("Failed to toggle voltage range"));
        }
        self.range.high_voltage = enabled;
        tracing::debug!(high_voltage = enabled, "Voltage range switched");
        Ok(())
    }

    /// Command the current range directly
    pub fn set_high_current(&mut self, enabled: bool) -> Result<()> {
        let toggle = encode_mode_toggle(RangeToggle::Current, enabled);
        if let Err(e) = self.link.write_command(&[toggle]) {
            self.stats.write_failures += 1;
            return Err(e.with_context("Failed to toggle current range"));
        }
        self.range.high_current = enabled;
        tracing::debug!(high_current = enabled, "Current range switched");
        Ok(())
    }

    /// Start a sweep and issue its first setpoint
    ///
    /// Returns `Ok(Some(outcome))` in the degenerate case where the first
    /// setpoint write already exhausted the write failure limit.
    pub fn start_sweep(
        &mut self,
        config: SweepConfig,
        now: Instant,
    ) -> Result<Option<SweepOutcome>> {
        if !self.link.is_open() {
            return Err(IvBenchError::LinkClosed);
        }
        let first = self.sweep.start(config, now)?;

        let wrote = match self.set_current(first) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("First sweep setpoint failed: {}", e);
                false
            }
        };
        let outcome = self.sweep.note_write_result(wrote);
        if outcome.is_some() {
            self.stats.sweeps_completed += 1;
        }
        Ok(outcome)
    }

    /// Stop an active sweep, aggregating whatever was captured
    ///
    /// Returns `None` when no sweep is running, so a second stop is a
    /// no-op.
    pub fn stop_sweep(&mut self) -> Option<SweepOutcome> {
        let outcome = self.sweep.stop();
        if outcome.is_some() {
            self.stats.sweeps_completed += 1;
        }
        outcome
    }

    /// Check whether the sweep timer has lapsed
    pub fn sweep_tick_due(&self, now: Instant) -> bool {
        self.sweep.tick_due(now)
    }

    /// Advance the sweep one step and issue the stepped setpoint
    ///
    /// Returns the outcome when this tick finished or aborted the sweep.
    pub fn sweep_tick(&mut self, now: Instant) -> Option<SweepOutcome> {
        match self.sweep.tick(self.range.high_current, now) {
            TickOutcome::Idle => None,
            TickOutcome::Setpoint(raw) => {
                let wrote = match self.set_current(raw) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Sweep setpoint {} failed: {}", raw, e);
                        false
                    }
                };
                let outcome = self.sweep.note_write_result(wrote);
                if outcome.is_some() {
                    self.stats.sweeps_completed += 1;
                }
                outcome
            }
            TickOutcome::Finished { setpoint, outcome } => {
                // The terminal setpoint still goes to the instrument; its
                // write result cannot change a finished outcome.
                if let Err(e) = self.set_current(setpoint) {
                    tracing::warn!("Final sweep setpoint {} failed: {}", setpoint, e);
                }
                self.stats.sweeps_completed += 1;
                Some(outcome)
            }
        }
    }

    /// Current sweep phase
    pub fn sweep_phase(&self) -> SweepPhase {
        self.sweep.phase()
    }

    /// Drain the link and fold new telemetry into the session
    ///
    /// Malformed lines are counted and skipped without interrupting the
    /// stream. Returns the decoded samples in arrival order.
    pub fn poll_telemetry(&mut self) -> Result<Vec<ScaledSample>> {
        let lines = self.link.poll_lines()?;
        let mut samples = Vec::with_capacity(lines.len());

        for line in &lines {
            match decode_line(line) {
                Ok(raw) => {
                    let sample = self.scaler.scale(&raw);
                    self.history.record(&sample);
                    self.sweep
                        .capture(sample.drop_voltage_v, sample.corrected_current_ua);
                    self.stats.frames_decoded += 1;
                    samples.push(sample);
                }
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    tracing::debug!("Discarding telemetry line: {}", e);
                }
            }
        }

        let link_stats = self.link.stats();
        self.stats.bytes_read = link_stats.bytes_read;
        self.stats.sample_rate_hz = link_stats.line_rate_hz();

        Ok(samples)
    }

    /// Most recent scaled sample, if any telemetry has arrived
    pub fn latest_sample(&self) -> Option<&ScaledSample> {
        self.history.latest()
    }

    /// Rolling per-channel history
    pub fn history(&self) -> &SampleHistory {
        &self.history
    }

    /// Snapshot one channel oldest to newest
    pub fn snapshot(&self, kind: ChannelKind) -> Vec<f64> {
        self.history.snapshot(kind)
    }

    /// Curve from the most recently ended sweep, if it aggregated
    pub fn last_curve(&self) -> Option<&AggregatedCurve> {
        self.sweep.last_curve()
    }

    /// Outcome of the most recently ended sweep
    pub fn last_outcome(&self) -> Option<&SweepOutcome> {
        self.sweep.last_outcome()
    }

    /// Range state as commanded over the wire
    pub fn range(&self) -> RangeState {
        self.range
    }

    /// Last setpoint issued, in raw counts
    pub fn last_setpoint(&self) -> i32 {
        self.last_setpoint
    }

    /// Engine statistics
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Mutable engine statistics
    pub fn stats_mut(&mut self) -> &mut EngineStats {
        &mut self.stats
    }

    /// Clear the history and reset all statistics
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.stats = EngineStats::default();
        self.link.reset_stats();
        tracing::info!("History and statistics cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkStats;
    use crate::sweep::SweepTermination;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Shared view of the commands a [`ScriptedLink`] has written
    #[derive(Clone, Default)]
    struct WriteLog(Arc<Mutex<Vec<Vec<u8>>>>);

    impl WriteLog {
        fn commands(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .collect()
        }

        fn last(&self) -> Option<String> {
            self.commands().pop()
        }
    }

    /// Test double that replays scripted telemetry batches and records
    /// every command written to it
    struct ScriptedLink {
        open: bool,
        batches: VecDeque<Vec<String>>,
        log: WriteLog,
        fail_writes: Arc<AtomicBool>,
        stats: LinkStats,
    }

    impl ScriptedLink {
        fn new() -> Self {
            Self {
                open: false,
                batches: VecDeque::new(),
                log: WriteLog::default(),
                fail_writes: Arc::new(AtomicBool::new(false)),
                stats: LinkStats::default(),
            }
        }

        fn queue_lines(&mut self, lines: &[&str]) {
            self.batches
                .push_back(lines.iter().map(|s| s.to_string()).collect());
        }

        fn log(&self) -> WriteLog {
            self.log.clone()
        }

        fn failure_switch(&self) -> Arc<AtomicBool> {
            self.fail_writes.clone()
        }
    }

    impl InstrumentLink for ScriptedLink {
        fn open(&mut self, _port: Option<&str>) -> Result<()> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn port_name(&self) -> Option<&str> {
            Some("scripted")
        }

        fn poll_lines(&mut self) -> Result<Vec<String>> {
            Ok(self.batches.pop_front().unwrap_or_default())
        }

        fn write_command(&mut self, bytes: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                self.stats.record_write_failure();
                return Err(IvBenchError::LinkClosed);
            }
            self.log.0.lock().unwrap().push(bytes.to_vec());
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

    fn open_session(link: ScriptedLink) -> BenchSession {
        let mut session = BenchSession::new(&BenchProfile::default(), Box::new(link));
        session.open_link(None).unwrap();
        session
    }

    #[test]
    fn test_set_current_in_low_range() {
        let link = ScriptedLink::new();
        let log = link.log();
        let mut session = open_session(link);

        session.set_current(100).unwrap();

        assert_eq!(log.commands(), vec!["S100\n".to_string()]);
        assert!(!session.range().high_current);
        assert_eq!(session.last_setpoint(), 100);
    }

    #[test]
    fn test_set_current_crossing_range_boundaries() {
        let link = ScriptedLink::new();
        let log = link.log();
        let mut session = open_session(link);

        session.set_current(100_000).unwrap();
        assert_eq!(
            log.commands(),
            vec!["S1000\n".to_string(), "C".to_string()]
        );
        assert!(session.range().high_current);

        session.set_current(50).unwrap();
        assert_eq!(
            log.commands(),
            vec![
                "S1000\n".to_string(),
                "C".to_string(),
                "S50\n".to_string(),
                "c".to_string()
            ]
        );
        assert!(!session.range().high_current);
    }

    #[test]
    fn test_nudge_is_relative_to_last_setpoint() {
        let link = ScriptedLink::new();
        let log = link.log();
        let mut session = open_session(link);

        session.set_current(200).unwrap();
        session.nudge(-25).unwrap();

        assert_eq!(log.last(), Some("S175\n".to_string()));
        assert_eq!(session.last_setpoint(), 175);
    }

    #[test]
    fn test_manual_range_toggles() {
        let link = ScriptedLink::new();
        let log = link.log();
        let mut session = open_session(link);

        session.set_high_voltage(true).unwrap();
        session.set_high_current(true).unwrap();
        assert!(session.range().high_voltage);
        assert!(session.range().high_current);

        session.set_high_voltage(false).unwrap();
        assert_eq!(
            log.commands(),
            vec!["V".to_string(), "C".to_string(), "v".to_string()]
        );
        assert!(!session.range().high_voltage);
    }

    #[test]
    fn test_open_resets_commanded_state() {
        let link = ScriptedLink::new();
        let log = link.log();
        let mut session = open_session(link);

        // Above the DAC ceiling the setpoint itself selects the high range.
        session.set_current(410_000).unwrap();
        assert_eq!(
            log.commands(),
            vec!["S4100\n".to_string(), "C".to_string()]
        );
        assert!(session.range().high_current);
        assert_eq!(session.last_setpoint(), 410_000);

        session.open_link(None).unwrap();
        assert!(!session.range().high_current);
        assert_eq!(session.last_setpoint(), 0);
    }

    #[test]
    fn test_poll_telemetry_scales_and_skips_malformed() {
        let mut link = ScriptedLink::new();
        link.queue_lines(&["100;5;98;0;0", "garbage", "200;10;195;0;0"]);
        let mut session = open_session(link);

        let samples = session.poll_telemetry().unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(session.stats().frames_decoded, 2);
        assert_eq!(session.stats().malformed_frames, 1);
        assert_eq!(session.history().len(), 2);

        let latest = session.latest_sample().unwrap();
        assert!((latest.set_current_ua - 20.0).abs() < 1e-9);
        assert!((latest.drop_voltage_v - 0.010).abs() < 1e-9);
    }

    #[test]
    fn test_start_sweep_requires_open_link() {
        let link = ScriptedLink::new();
        let mut session = BenchSession::new(&BenchProfile::default(), Box::new(link));

        let err = session
            .start_sweep(SweepConfig::default(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, IvBenchError::LinkClosed));
        assert_eq!(session.sweep_phase(), SweepPhase::Idle);
    }

    #[test]
    fn test_sweep_completes_and_aggregates() {
        let mut link = ScriptedLink::new();
        link.queue_lines(&["0;0;0;0;0"]);
        link.queue_lines(&["10;1;10;0;0"]);
        link.queue_lines(&["20;2;20;0;0"]);
        let log = link.log();
        let mut session = open_session(link);

        let config = SweepConfig {
            start: 0,
            end: 30,
            step: 10,
            interval_ms: 200,
        };
        let t0 = Instant::now();
        assert!(session.start_sweep(config, t0).unwrap().is_none());
        session.poll_telemetry().unwrap();

        assert!(session
            .sweep_tick(t0 + Duration::from_millis(200))
            .is_none());
        session.poll_telemetry().unwrap();

        assert!(session
            .sweep_tick(t0 + Duration::from_millis(400))
            .is_none());
        session.poll_telemetry().unwrap();

        let outcome = session
            .sweep_tick(t0 + Duration::from_millis(600))
            .expect("sweep should finish on the clamping tick");

        assert_eq!(outcome.termination, SweepTermination::Completed);
        assert_eq!(outcome.captured, 3);
        let curve = outcome.curve.as_ref().unwrap();
        assert_eq!(curve.bins.len(), 3);
        assert_eq!(log.last(), Some("S30\n".to_string()));
        assert_eq!(session.stats().sweeps_completed, 1);
        assert_eq!(session.sweep_phase(), SweepPhase::Idle);
    }

    #[test]
    fn test_sweep_aborts_after_consecutive_write_failures() {
        let link = ScriptedLink::new();
        let failures = link.failure_switch();
        let mut session = open_session(link);

        let config = SweepConfig {
            start: 0,
            end: 1000,
            step: 10,
            interval_ms: 200,
        };
        let t0 = Instant::now();
        assert!(session.start_sweep(config, t0).unwrap().is_none());

        failures.store(true, Ordering::SeqCst);
        assert!(session
            .sweep_tick(t0 + Duration::from_millis(200))
            .is_none());
        assert!(session
            .sweep_tick(t0 + Duration::from_millis(400))
            .is_none());
        let outcome = session
            .sweep_tick(t0 + Duration::from_millis(600))
            .expect("third consecutive failure should abort");

        assert_eq!(outcome.termination, SweepTermination::Aborted);
        assert_eq!(session.sweep_phase(), SweepPhase::Idle);
    }

    #[test]
    fn test_stop_sweep_is_idempotent() {
        let link = ScriptedLink::new();
        let mut session = open_session(link);

        session
            .start_sweep(SweepConfig::default(), Instant::now())
            .unwrap();
        let outcome = session.stop_sweep().expect("first stop ends the sweep");
        assert_eq!(outcome.termination, SweepTermination::Stopped);
        assert!(session.stop_sweep().is_none());
    }

    #[test]
    fn test_close_link_stops_running_sweep() {
        let link = ScriptedLink::new();
        let mut session = open_session(link);

        session
            .start_sweep(SweepConfig::default(), Instant::now())
            .unwrap();
        let outcome = session.close_link().expect("close stops the sweep");
        assert_eq!(outcome.termination, SweepTermination::Stopped);
        assert!(!session.is_open());
    }

    #[test]
    fn test_clear_history_resets_stats() {
        let mut link = ScriptedLink::new();
        link.queue_lines(&["100;5;98;0;0"]);
        let mut session = open_session(link);

        session.poll_telemetry().unwrap();
        session.set_current(10).unwrap();
        assert!(session.stats().frames_decoded > 0);

        session.clear_history();
        assert_eq!(session.stats().frames_decoded, 0);
        assert_eq!(session.stats().setpoints_issued, 0);
        assert!(session.history().is_empty());
        assert!(session.latest_sample().is_none());
    }
}
