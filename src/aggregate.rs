//! Post-sweep aggregation
//!
//! A sweep captures every `(drop voltage, corrected current)` pair that
//! arrived while it ran. Aggregation reduces that capture to one curve:
//! pairs are kept when their current lies inside the sweep range extended
//! by a tolerance margin on both ends, grouped by exact current value,
//! and summarised per group as mean, minimum, and maximum voltage. The
//! result is ordered by ascending current, ready to plot or export as an
//! I-V curve.

use crate::error::{IvBenchError, Result};
use serde::{Deserialize, Serialize};

/// Fraction of the sweep span the tolerance window extends past each endpoint
pub const WINDOW_MARGIN_FRACTION: f64 = 0.1;

/// Aggregated statistics for one distinct current value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveBin {
    /// The current value this bin represents, in microamps
    pub current_ua: f64,
    /// Mean drop voltage over the bin, in volts
    pub mean_voltage_v: f64,
    /// Minimum drop voltage over the bin, in volts
    pub min_voltage_v: f64,
    /// Maximum drop voltage over the bin, in volts
    pub max_voltage_v: f64,
    /// Number of captured pairs in the bin
    pub samples: usize,
}

/// The aggregated I-V curve of one sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCurve {
    /// Bins ordered by ascending current, one per distinct current value
    pub bins: Vec<CurveBin>,
}

impl AggregatedCurve {
    /// Number of bins in the curve
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Check whether the curve carries no bins
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// The current range covered by the curve, in microamps
    pub fn current_span(&self) -> Option<(f64, f64)> {
        match (self.bins.first(), self.bins.last()) {
            (Some(first), Some(last)) => Some((first.current_ua, last.current_ua)),
            _ => None,
        }
    }

    /// Get data points for plotting (current, mean voltage pairs)
    pub fn plot_points(&self) -> Vec<[f64; 2]> {
        self.bins
            .iter()
            .map(|b| [b.current_ua, b.mean_voltage_v])
            .collect()
    }
}

/// Aggregate captured `(voltage, current)` pairs into an I-V curve
///
/// `start` and `end` are the sweep endpoints in the same current units as
/// the captured pairs. The tolerance window extends
/// [`WINDOW_MARGIN_FRACTION`] of the span past each endpoint and is
/// normalised, so descending sweeps filter the same way ascending ones
/// do. When no pair survives the window the sweep produced nothing
/// usable and [`IvBenchError::EmptyAggregation`] is returned.
pub fn aggregate(pairs: &[(f64, f64)], start: f64, end: f64) -> Result<AggregatedCurve> {
    let margin = WINDOW_MARGIN_FRACTION * (end - start);
    let a = start - margin;
    let b = end + margin;
    let (low, high) = (a.min(b), a.max(b));

    let mut surviving: Vec<(f64, f64)> = pairs
        .iter()
        .filter(|(_, current)| *current >= low && *current <= high)
        .copied()
        .collect();

    if surviving.is_empty() {
        return Err(IvBenchError::EmptyAggregation);
    }

    surviving.sort_by(|x, y| x.1.total_cmp(&y.1));

    let mut bins = Vec::new();
    let mut run_start = 0;
    while run_start < surviving.len() {
        let current = surviving[run_start].1;
        let mut run_end = run_start + 1;
        while run_end < surviving.len() && surviving[run_end].1 == current {
            run_end += 1;
        }

        let voltages = &surviving[run_start..run_end];
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for (voltage, _) in voltages {
            min = min.min(*voltage);
            max = max.max(*voltage);
            sum += voltage;
        }

        bins.push(CurveBin {
            current_ua: current,
            mean_voltage_v: sum / voltages.len() as f64,
            min_voltage_v: min,
            max_voltage_v: max,
            samples: voltages.len(),
        });

        run_start = run_end;
    }

    Ok(AggregatedCurve { bins })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_groups_by_exact_current() {
        let pairs = [(1.0, 100.0), (1.2, 100.0), (0.9, 100.0), (2.0, 200.0)];
        let curve = aggregate(&pairs, 100.0, 200.0).unwrap();

        assert_eq!(curve.len(), 2);

        let first = &curve.bins[0];
        assert_eq!(first.current_ua, 100.0);
        assert!((first.mean_voltage_v - (1.0 + 1.2 + 0.9) / 3.0).abs() < 1e-9);
        assert_eq!(first.min_voltage_v, 0.9);
        assert_eq!(first.max_voltage_v, 1.2);
        assert_eq!(first.samples, 3);

        let second = &curve.bins[1];
        assert_eq!(second.current_ua, 200.0);
        assert_eq!(second.samples, 1);
        assert_eq!(second.mean_voltage_v, 2.0);
    }

    #[test]
    fn test_window_extends_ten_percent() {
        // Span 100..200 widens to 90..210
        let pairs = [
            (0.1, 90.0),
            (0.2, 89.9),
            (0.3, 210.0),
            (0.4, 210.1),
            (0.5, 150.0),
        ];
        let curve = aggregate(&pairs, 100.0, 200.0).unwrap();

        let kept: Vec<f64> = curve.bins.iter().map(|b| b.current_ua).collect();
        assert_eq!(kept, vec![90.0, 150.0, 210.0]);
    }

    #[test]
    fn test_descending_sweep_uses_same_window() {
        let pairs = [(0.1, 90.0), (0.2, 210.0), (0.3, 250.0)];
        let curve = aggregate(&pairs, 200.0, 100.0).unwrap();

        let kept: Vec<f64> = curve.bins.iter().map(|b| b.current_ua).collect();
        assert_eq!(kept, vec![90.0, 210.0]);
    }

    #[test]
    fn test_empty_window_is_an_error() {
        let pairs = [(1.0, 500.0), (1.1, 600.0)];
        let err = aggregate(&pairs, 0.0, 100.0).unwrap_err();
        assert!(matches!(err, IvBenchError::EmptyAggregation));

        assert!(matches!(
            aggregate(&[], 0.0, 100.0),
            Err(IvBenchError::EmptyAggregation)
        ));
    }

    #[test]
    fn test_single_pair_bin() {
        let curve = aggregate(&[(0.7, 50.0)], 0.0, 100.0).unwrap();
        assert_eq!(curve.len(), 1);
        let bin = &curve.bins[0];
        assert_eq!(bin.mean_voltage_v, 0.7);
        assert_eq!(bin.min_voltage_v, 0.7);
        assert_eq!(bin.max_voltage_v, 0.7);
    }

    #[test]
    fn test_plot_points_follow_bins() {
        let pairs = [(1.0, 10.0), (2.0, 20.0)];
        let curve = aggregate(&pairs, 0.0, 30.0).unwrap();
        assert_eq!(curve.plot_points(), vec![[10.0, 1.0], [20.0, 2.0]]);
        assert_eq!(curve.current_span(), Some((10.0, 20.0)));
    }

    // Property-based tests using proptest
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_bins_strictly_ascending_and_unique(
            pairs in prop::collection::vec((0.0f64..5.0, 0.0f64..1000.0), 1..200)
        ) {
            if let Ok(curve) = aggregate(&pairs, 0.0, 1000.0) {
                for window in curve.bins.windows(2) {
                    prop_assert!(window[0].current_ua < window[1].current_ua);
                }
            }
        }

        #[test]
        fn test_bin_mean_within_min_max(
            pairs in prop::collection::vec((-5.0f64..5.0, 0.0f64..100.0), 1..200)
        ) {
            if let Ok(curve) = aggregate(&pairs, 0.0, 100.0) {
                for bin in &curve.bins {
                    prop_assert!(bin.min_voltage_v <= bin.mean_voltage_v + 1e-12);
                    prop_assert!(bin.mean_voltage_v <= bin.max_voltage_v + 1e-12);
                    prop_assert!(bin.samples > 0);
                }
            }
        }

        #[test]
        fn test_all_bins_inside_window(
            pairs in prop::collection::vec((0.0f64..1.0, -100.0f64..300.0), 1..200),
            start in 0.0f64..100.0,
            span in 1.0f64..100.0,
        ) {
            let end = start + span;
            let margin = WINDOW_MARGIN_FRACTION * span;
            if let Ok(curve) = aggregate(&pairs, start, end) {
                for bin in &curve.bins {
                    prop_assert!(bin.current_ua >= start - margin - 1e-9);
                    prop_assert!(bin.current_ua <= end + margin + 1e-9);
                }
            }
        }
    }
}
