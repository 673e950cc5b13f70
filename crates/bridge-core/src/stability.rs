//! Consumer-side stability detection.
//!
//! The balance reports its own stability flag, but lab workflows usually want
//! a stricter, application-level verdict: the last `window` readings must all
//! sit within `tolerance` of each other. The detector is a pure fold over the
//! ordered sequence of values; it owns no I/O and holds no connection state.

use std::collections::VecDeque;

use crate::reading::Reading;

/// Default number of readings that must agree.
pub const DEFAULT_WINDOW: usize = 5;

/// Default maximum spread (max - min) across the window.
pub const DEFAULT_TOLERANCE: f64 = 0.5;

/// Rolling-window stability verdict.
///
/// # Example
///
/// ```
/// use bridge_core::StabilityDetector;
///
/// let mut detector = StabilityDetector::default();
/// for _ in 0..4 {
///     assert!(!detector.push(10.0));
/// }
/// assert!(detector.push(10.2));
/// ```
#[derive(Debug, Clone)]
pub struct StabilityDetector {
    window: usize,
    tolerance: f64,
    values: VecDeque<f64>,
    unit: Option<String>,
}

impl StabilityDetector {
    /// Create a detector. A zero `window` is treated as one.
    pub fn new(window: usize, tolerance: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            tolerance,
            values: VecDeque::with_capacity(window),
            unit: None,
        }
    }

    /// Append a value and return the verdict over the current window.
    pub fn push(&mut self, value: f64) -> bool {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.is_stable()
    }

    /// Append a reading. A change of unit restarts the window.
    pub fn push_reading(&mut self, reading: &Reading) -> bool {
        if self.unit.as_deref() != Some(reading.unit.as_str()) {
            self.values.clear();
            self.unit = Some(reading.unit.clone());
        }
        self.push(reading.value)
    }

    /// Verdict without adding a value.
    pub fn is_stable(&self) -> bool {
        if self.values.len() < self.window {
            return false;
        }
        self.spread().is_some_and(|spread| spread <= self.tolerance)
    }

    /// Max minus min over the buffered values, `None` when empty.
    pub fn spread(&self) -> Option<f64> {
        let mut iter = self.values.iter().copied();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(max - min)
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no values are buffered.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop all buffered values (after tare, zero or a reconnect).
    pub fn reset(&mut self) {
        self.values.clear();
        self.unit = None;
    }
}

impl Default for StabilityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_TOLERANCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdicts(values: &[f64]) -> Vec<bool> {
        let mut detector = StabilityDetector::default();
        values.iter().map(|v| detector.push(*v)).collect()
    }

    #[test]
    fn identical_values_become_stable_when_window_fills() {
        assert_eq!(
            verdicts(&[10.0, 10.0, 10.0, 10.0, 10.0]),
            vec![false, false, false, false, true]
        );
    }

    #[test]
    fn outlier_keeps_window_unstable_until_it_leaves() {
        let mut detector = StabilityDetector::default();
        for v in [10.0, 10.6, 10.0, 10.0, 10.0] {
            assert!(!detector.push(v));
        }
        // leading 10.0 evicted, 10.6 still buffered
        assert!(!detector.push(10.0));
        // 10.6 evicted
        assert!(detector.push(10.0));
        assert_eq!(detector.spread(), Some(0.0));
    }

    #[test]
    fn fewer_than_window_is_never_stable() {
        assert!(verdicts(&[1.0, 1.0, 1.0, 1.0]).iter().all(|v| !v));
    }

    #[test]
    fn spread_exactly_at_tolerance_is_stable() {
        let mut detector = StabilityDetector::new(3, 0.5);
        detector.push(1.0);
        detector.push(1.5);
        assert!(detector.push(1.25));
    }

    #[test]
    fn unit_change_restarts_window() {
        let mut detector = StabilityDetector::new(2, 0.1);
        assert!(!detector.push_reading(&Reading::new(1.0, "g", true)));
        assert!(detector.push_reading(&Reading::new(1.0, "g", true)));
        assert!(!detector.push_reading(&Reading::new(1.0, "kg", true)));
        assert_eq!(detector.len(), 1);
    }

    #[test]
    fn reset_clears_window() {
        let mut detector = StabilityDetector::new(1, 0.0);
        assert!(detector.push(3.0));
        detector.reset();
        assert!(detector.is_empty());
        assert!(!detector.is_stable());
    }
}
