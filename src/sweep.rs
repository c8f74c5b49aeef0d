//! Sweep state machine
//!
//! A sweep walks the current setpoint from a start value to an end value
//! in fixed steps on a fixed interval, captures every telemetry pair that
//! arrives while it runs, and aggregates the capture into an I-V curve
//! when it ends. The controller is synchronous: the owner checks
//! [`SweepController::tick_due`] on its own schedule, issues the setpoint
//! each tick reports, and feeds telemetry in through
//! [`SweepController::capture`].
//!
//! # Lifecycle
//!
//! `Idle -> Running -> Idle`. A sweep leaves `Running` exactly once, by
//! reaching the end value, by an explicit stop, or by aborting after too
//! many consecutive write failures. All three paths aggregate the capture
//! exactly once and record a [`SweepOutcome`]. A tick that lands after
//! the sweep ended is a no-op, and the tick timer is armed if and only if
//! the sweep is running.
//!
//! # Stepping across ranges
//!
//! Setpoints are raw counts. While the commanded DAC range is
//! high-current the wire value is divided by 100 and the hardware gain
//! multiplies it back, so a raw step of `n` moves the physical current
//! 100 times further. The controller multiplies the step by 100 in that
//! range to keep the physical increment constant across the boundary.

use crate::aggregate::{aggregate, AggregatedCurve};
use crate::calibrate::CURRENT_SCALE_DIVISOR;
use crate::config::{DEFAULT_SWEEP_INTERVAL_MS, DEFAULT_WRITE_FAILURE_LIMIT};
use crate::error::{IvBenchError, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Raw step multiplier while the high current range is commanded
pub const HIGH_RANGE_STEP_MULTIPLIER: i32 = 100;

/// Parameters of one sweep, in raw setpoint counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// First setpoint issued
    pub start: i32,
    /// Final setpoint issued
    pub end: i32,
    /// Raw increment per tick
    pub step: i32,
    /// Tick interval in milliseconds
    pub interval_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start: 0,
            end: 1000,
            step: 10,
            interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl SweepConfig {
    /// Check that the sweep can terminate
    ///
    /// The step must be nonzero and move from start toward end, which
    /// also rejects a sweep whose endpoints are equal.
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(IvBenchError::InvalidSweep("step must be nonzero".into()));
        }
        let span = self.end as i64 - self.start as i64;
        if span == 0 {
            return Err(IvBenchError::InvalidSweep(
                "start and end must differ".into(),
            ));
        }
        if (span > 0) != (self.step > 0) {
            return Err(IvBenchError::InvalidSweep(
                "step must move from start toward end".into(),
            ));
        }
        Ok(())
    }

    /// The tick interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Current phase of the sweep state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepPhase {
    /// No sweep active
    #[default]
    Idle,
    /// A sweep is stepping
    Running,
}

impl std::fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepPhase::Idle => write!(f, "Idle"),
            SweepPhase::Running => write!(f, "Running"),
        }
    }
}

/// How a sweep left the running phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepTermination {
    /// The setpoint reached the end value
    Completed,
    /// The caller stopped the sweep early
    Stopped,
    /// Too many consecutive setpoint writes failed
    Aborted,
}

impl std::fmt::Display for SweepTermination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepTermination::Completed => write!(f, "completed"),
            SweepTermination::Stopped => write!(f, "stopped"),
            SweepTermination::Aborted => write!(f, "aborted"),
        }
    }
}

/// Record of one finished sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// The configuration the sweep ran with
    pub config: SweepConfig,
    /// How the sweep ended
    pub termination: SweepTermination,
    /// Number of telemetry pairs captured while running
    pub captured: usize,
    /// The aggregated curve, or None when nothing fell inside the window
    pub curve: Option<AggregatedCurve>,
}

/// What one tick asks the owner to do
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No sweep is running, nothing to issue
    Idle,
    /// Issue this raw setpoint and keep going
    Setpoint(i32),
    /// Issue this final raw setpoint; the sweep is done
    Finished {
        /// The clamped final setpoint
        setpoint: i32,
        /// The recorded outcome
        outcome: SweepOutcome,
    },
}

/// Drives the sweep state machine
#[derive(Debug)]
pub struct SweepController {
    /// Current phase
    phase: SweepPhase,
    /// The active configuration, meaningful while running
    config: SweepConfig,
    /// Raw setpoint most recently issued by the sweep
    current: i32,
    /// Telemetry pairs captured while running (voltage, corrected current)
    captured: Vec<(f64, f64)>,
    /// Consecutive setpoint write failures
    consecutive_write_failures: u32,
    /// Failure streak that aborts the sweep
    write_failure_limit: u32,
    /// Next scheduled tick, armed exactly while running
    next_tick: Option<Instant>,
    /// Outcome of the most recent sweep
    last_outcome: Option<SweepOutcome>,
}

impl Default for SweepController {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_FAILURE_LIMIT)
    }
}

impl SweepController {
    /// Create an idle controller
    pub fn new(write_failure_limit: u32) -> Self {
        Self {
            phase: SweepPhase::Idle,
            config: SweepConfig::default(),
            current: 0,
            captured: Vec::new(),
            consecutive_write_failures: 0,
            write_failure_limit: write_failure_limit.max(1),
            next_tick: None,
            last_outcome: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> SweepPhase {
        self.phase
    }

    /// Check whether a sweep is running
    pub fn is_running(&self) -> bool {
        self.phase == SweepPhase::Running
    }

    /// The outcome of the most recent sweep, if any finished yet
    pub fn last_outcome(&self) -> Option<&SweepOutcome> {
        self.last_outcome.as_ref()
    }

    /// The curve of the most recent sweep that aggregated to one
    pub fn last_curve(&self) -> Option<&AggregatedCurve> {
        self.last_outcome.as_ref()?.curve.as_ref()
    }

    /// Number of pairs captured so far in the running sweep
    pub fn captured_len(&self) -> usize {
        self.captured.len()
    }

    /// The next scheduled tick, armed exactly while running
    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Check whether the periodic tick is due
    pub fn tick_due(&self, now: Instant) -> bool {
        matches!(self.next_tick, Some(at) if at <= now)
    }

    /// Start a sweep
    ///
    /// Validates the configuration, resets the capture buffer, and arms
    /// the tick timer. Returns the first raw setpoint for the caller to
    /// issue. Starting while a sweep is running is rejected.
    pub fn start(&mut self, config: SweepConfig, now: Instant) -> Result<i32> {
        if self.is_running() {
            return Err(IvBenchError::InvalidSweep(
                "a sweep is already running".into(),
            ));
        }
        config.validate()?;

        self.config = config;
        self.current = config.start;
        self.captured.clear();
        self.consecutive_write_failures = 0;
        self.phase = SweepPhase::Running;
        self.next_tick = Some(now + config.interval());

        tracing::info!(
            start = config.start,
            end = config.end,
            step = config.step,
            interval_ms = config.interval_ms,
            "Sweep started"
        );

        Ok(config.start)
    }

    /// Advance the sweep by one step
    ///
    /// `high_current_range` is the commanded DAC range at the time of the
    /// tick. The owner checks [`Self::tick_due`] first; the tick itself
    /// advances unconditionally so it can also be driven directly in
    /// tests. A tick while idle does nothing.
    pub fn tick(&mut self, high_current_range: bool, now: Instant) -> TickOutcome {
        if !self.is_running() {
            return TickOutcome::Idle;
        }

        let step = if high_current_range {
            self.config.step.saturating_mul(HIGH_RANGE_STEP_MULTIPLIER)
        } else {
            self.config.step
        };
        self.current = self.current.saturating_add(step);

        let crossed = if self.config.step > 0 {
            self.current >= self.config.end
        } else {
            self.current <= self.config.end
        };

        if crossed {
            self.current = self.config.end;
            let outcome = self.finish(SweepTermination::Completed);
            TickOutcome::Finished {
                setpoint: self.config.end,
                outcome,
            }
        } else {
            self.next_tick = Some(now + self.config.interval());
            tracing::trace!(setpoint = self.current, "Sweep tick");
            TickOutcome::Setpoint(self.current)
        }
    }

    /// Capture one telemetry pair
    ///
    /// Capture follows telemetry arrival, not the tick schedule; several
    /// pairs per tick are normal. Pairs arriving while idle are ignored.
    pub fn capture(&mut self, drop_voltage_v: f64, corrected_current_ua: f64) {
        if self.is_running() {
            self.captured.push((drop_voltage_v, corrected_current_ua));
        }
    }

    /// Record the result of a setpoint write
    ///
    /// A failed write never rolls the sweep back; the failure is counted
    /// and the sweep keeps stepping. Once the consecutive failure streak
    /// reaches the limit the sweep aborts, returning the outcome. Any
    /// successful write resets the streak.
    pub fn note_write_result(&mut self, ok: bool) -> Option<SweepOutcome> {
        if !self.is_running() {
            return None;
        }

        if ok {
            self.consecutive_write_failures = 0;
            return None;
        }

        self.consecutive_write_failures += 1;
        if self.consecutive_write_failures >= self.write_failure_limit {
            tracing::warn!(
                failures = self.consecutive_write_failures,
                "Sweep aborted after consecutive write failures"
            );
            return Some(self.finish(SweepTermination::Aborted));
        }
        None
    }

    /// Stop the running sweep
    ///
    /// Returns the outcome, or None when no sweep is running; stopping
    /// twice is a no-op and never re-aggregates.
    pub fn stop(&mut self) -> Option<SweepOutcome> {
        if !self.is_running() {
            return None;
        }
        Some(self.finish(SweepTermination::Stopped))
    }

    /// Leave the running phase, aggregate the capture once, and record
    /// the outcome
    fn finish(&mut self, termination: SweepTermination) -> SweepOutcome {
        self.phase = SweepPhase::Idle;
        self.next_tick = None;

        let start_ua = self.config.start as f64 / CURRENT_SCALE_DIVISOR;
        let end_ua = self.config.end as f64 / CURRENT_SCALE_DIVISOR;
        let curve = match aggregate(&self.captured, start_ua, end_ua) {
            Ok(curve) => Some(curve),
            Err(IvBenchError::EmptyAggregation) => None,
            Err(_) => None,
        };

        let outcome = SweepOutcome {
            config: self.config,
            termination,
            captured: self.captured.len(),
            curve,
        };

        tracing::info!(
            termination = %termination,
            captured = outcome.captured,
            bins = outcome.curve.as_ref().map(|c| c.len()).unwrap_or(0),
            "Sweep finished"
        );

        self.last_outcome = Some(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start: i32, end: i32, step: i32) -> SweepConfig {
        SweepConfig {
            start,
            end,
            step,
            interval_ms: 200,
        }
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(config(0, 100, 0).validate().is_err());
        assert!(config(100, 100, 10).validate().is_err());
        assert!(config(0, 100, -10).validate().is_err());
        assert!(config(100, 0, 10).validate().is_err());

        assert!(config(0, 100, 10).validate().is_ok());
        assert!(config(100, 0, -10).validate().is_ok());
    }

    #[test]
    fn test_start_arms_timer_and_reports_first_setpoint() {
        let mut sweep = SweepController::default();
        let now = Instant::now();

        let first = sweep.start(config(50, 200, 10), now).unwrap();
        assert_eq!(first, 50);
        assert!(sweep.is_running());
        assert!(sweep.next_tick().is_some());

        assert!(!sweep.tick_due(now));
        assert!(sweep.tick_due(now + Duration::from_millis(200)));
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let mut sweep = SweepController::default();
        let now = Instant::now();
        sweep.start(config(0, 100, 10), now).unwrap();

        let err = sweep.start(config(0, 100, 10), now).unwrap_err();
        assert!(matches!(err, IvBenchError::InvalidSweep(_)));
        assert!(sweep.is_running());
    }

    #[test]
    fn test_invalid_config_leaves_controller_idle() {
        let mut sweep = SweepController::default();
        assert!(sweep.start(config(0, 100, 0), Instant::now()).is_err());
        assert!(!sweep.is_running());
        assert!(sweep.next_tick().is_none());
    }

    #[test]
    fn test_completes_in_exact_tick_count() {
        let mut sweep = SweepController::default();
        let mut now = Instant::now();
        sweep.start(config(0, 1000, 10), now).unwrap();

        let mut ticks = 0;
        loop {
            now += Duration::from_millis(200);
            ticks += 1;
            match sweep.tick(false, now) {
                TickOutcome::Setpoint(value) => {
                    assert_eq!(value, ticks * 10);
                    assert!(value < 1000);
                }
                TickOutcome::Finished { setpoint, outcome } => {
                    assert_eq!(setpoint, 1000);
                    assert_eq!(outcome.termination, SweepTermination::Completed);
                    break;
                }
                TickOutcome::Idle => panic!("sweep went idle early"),
            }
        }

        assert_eq!(ticks, 100);
        assert!(!sweep.is_running());
        assert!(sweep.next_tick().is_none());
    }

    #[test]
    fn test_descending_sweep_clamps_at_end() {
        let mut sweep = SweepController::default();
        let now = Instant::now();
        sweep.start(config(25, 0, -10), now).unwrap();

        assert_eq!(sweep.tick(false, now), TickOutcome::Setpoint(15));
        assert_eq!(sweep.tick(false, now), TickOutcome::Setpoint(5));
        match sweep.tick(false, now) {
            TickOutcome::Finished { setpoint, .. } => assert_eq!(setpoint, 0),
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[test]
    fn test_high_range_multiplies_step() {
        let mut sweep = SweepController::default();
        let now = Instant::now();
        sweep.start(config(0, 10_000, 10), now).unwrap();

        assert_eq!(sweep.tick(false, now), TickOutcome::Setpoint(10));
        // Commanded range switched to high current
        assert_eq!(sweep.tick(true, now), TickOutcome::Setpoint(1010));
        assert_eq!(sweep.tick(true, now), TickOutcome::Setpoint(2010));
    }

    #[test]
    fn test_tick_while_idle_is_noop() {
        let mut sweep = SweepController::default();
        assert_eq!(sweep.tick(false, Instant::now()), TickOutcome::Idle);

        let now = Instant::now();
        sweep.start(config(0, 20, 10), now).unwrap();
        sweep.stop().unwrap();
        assert_eq!(sweep.tick(false, now), TickOutcome::Idle);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut sweep = SweepController::default();
        let now = Instant::now();
        sweep.start(config(0, 100, 10), now).unwrap();
        sweep.capture(1.0, 5.0);

        let outcome = sweep.stop().unwrap();
        assert_eq!(outcome.termination, SweepTermination::Stopped);
        assert_eq!(outcome.captured, 1);

        assert!(sweep.stop().is_none());
        assert!(sweep.last_outcome().is_some());
    }

    #[test]
    fn test_capture_feeds_aggregation() {
        let mut sweep = SweepController::default();
        let now = Instant::now();
        // Raw 100..200 is 10..20 uA
        sweep.start(config(100, 200, 10), now).unwrap();
        sweep.capture(1.0, 15.0);
        sweep.capture(1.2, 15.0);
        sweep.capture(9.9, 500.0); // far outside the window

        let outcome = sweep.stop().unwrap();
        let curve = outcome.curve.unwrap();
        assert_eq!(curve.len(), 1);
        assert_eq!(curve.bins[0].current_ua, 15.0);
        assert_eq!(curve.bins[0].samples, 2);
        assert_eq!(outcome.captured, 3);
    }

    #[test]
    fn test_capture_while_idle_is_ignored() {
        let mut sweep = SweepController::default();
        sweep.capture(1.0, 5.0);
        assert_eq!(sweep.captured_len(), 0);
    }

    #[test]
    fn test_empty_capture_yields_no_curve() {
        let mut sweep = SweepController::default();
        sweep.start(config(0, 100, 10), Instant::now()).unwrap();
        let outcome = sweep.stop().unwrap();
        assert_eq!(outcome.captured, 0);
        assert!(outcome.curve.is_none());
    }

    #[test]
    fn test_write_failures_abort_after_limit() {
        let mut sweep = SweepController::new(3);
        sweep.start(config(0, 1000, 10), Instant::now()).unwrap();

        assert!(sweep.note_write_result(false).is_none());
        assert!(sweep.note_write_result(false).is_none());
        let outcome = sweep.note_write_result(false).unwrap();
        assert_eq!(outcome.termination, SweepTermination::Aborted);
        assert!(!sweep.is_running());

        // No sweep running anymore, further reports are ignored
        assert!(sweep.note_write_result(false).is_none());
    }

    #[test]
    fn test_successful_write_resets_failure_streak() {
        let mut sweep = SweepController::new(3);
        sweep.start(config(0, 1000, 10), Instant::now()).unwrap();

        assert!(sweep.note_write_result(false).is_none());
        assert!(sweep.note_write_result(false).is_none());
        assert!(sweep.note_write_result(true).is_none());
        assert!(sweep.note_write_result(false).is_none());
        assert!(sweep.note_write_result(false).is_none());
        assert!(sweep.is_running());

        let outcome = sweep.note_write_result(false).unwrap();
        assert_eq!(outcome.termination, SweepTermination::Aborted);
    }

    #[test]
    fn test_timer_armed_exactly_while_running() {
        let mut sweep = SweepController::default();
        assert!(sweep.next_tick().is_none());

        let mut now = Instant::now();
        sweep.start(config(0, 30, 10), now).unwrap();
        assert!(sweep.next_tick().is_some());

        loop {
            now += Duration::from_millis(200);
            match sweep.tick(false, now) {
                TickOutcome::Setpoint(_) => assert!(sweep.next_tick().is_some()),
                TickOutcome::Finished { .. } => break,
                TickOutcome::Idle => panic!("sweep went idle early"),
            }
        }
        assert!(sweep.next_tick().is_none());
    }

    // Property-based tests using proptest
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_valid_sweep_always_terminates(
            start in -1000i32..1000,
            step in 1i32..100,
            count in 1i32..200,
        ) {
            let end = start + step * count;
            let mut sweep = SweepController::default();
            let now = Instant::now();
            sweep.start(config(start, end, step), now).unwrap();

            let mut ticks = 0;
            let final_setpoint = loop {
                ticks += 1;
                prop_assert!(ticks <= count, "sweep exceeded tick bound");
                match sweep.tick(false, now) {
                    TickOutcome::Setpoint(_) => continue,
                    TickOutcome::Finished { setpoint, .. } => break setpoint,
                    TickOutcome::Idle => panic!("sweep went idle early"),
                }
            };

            prop_assert_eq!(final_setpoint, end);
            prop_assert_eq!(ticks, count);
            prop_assert!(!sweep.is_running());
        }
    }
}
