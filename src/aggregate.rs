//! Streaming reductions over timestamped samples.

use std::collections::VecDeque;

/// Time-windowed arithmetic mean.
///
/// History is kept sorted by timestamp and pruned to `window` seconds on
/// every write and every read.
#[derive(Debug, Clone)]
pub struct WindowedAverage {
    window: f64,
    minimum_window: f64,
    history: VecDeque<(f64, f64)>,
}

impl WindowedAverage {
    pub fn new(window: f64, minimum_window: f64) -> Self {
        WindowedAverage {
            window,
            minimum_window,
            history: VecDeque::new(),
        }
    }

    /// Add a sample. NaN values are not recorded. A sample older than the
    /// newest one is inserted in timestamp order.
    pub fn add(&mut self, value: f64, timestamp: f64) {
        if value.is_nan() || timestamp.is_nan() {
            return;
        }
        let position = self.history.partition_point(|&(_, t)| t <= timestamp);
        self.history.insert(position, (value, timestamp));
        let newest = self.history.back().map_or(timestamp, |&(_, t)| t);
        self.prune(newest);
    }

    fn prune(&mut self, now: f64) {
        let cutoff = now - self.window;
        while self.history.front().is_some_and(|&(_, t)| t < cutoff) {
            self.history.pop_front();
        }
    }

    /// Mean of the samples in the window ending at `now`.
    ///
    /// NaN when nothing is retained, or when the oldest retained sample is
    /// younger than `minimum_window`: a freshly started history is too thin
    /// to act on.
    pub fn average(&mut self, now: f64) -> f64 {
        self.prune(now);
        let Some(&(_, oldest)) = self.history.front() else {
            return f64::NAN;
        };
        if now - oldest < self.minimum_window {
            return f64::NAN;
        }
        self.history.iter().map(|&(value, _)| value).sum::<f64>() / self.history.len() as f64
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn oldest(&self) -> Option<f64> {
        self.history.front().map(|&(_, t)| t)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    Minimum,
    Maximum,
}

/// Running minimum or maximum over one night.
///
/// Any day-side sample arms a reset; the first night-side sample after that
/// starts the reduction over. This starts each night fresh exactly once no
/// matter how samples from different streams interleave.
#[derive(Debug, Clone)]
pub struct NightlyExtreme {
    kind: Extreme,
    value: Option<f64>,
    needs_reset: bool,
}

impl NightlyExtreme {
    pub fn new(kind: Extreme) -> Self {
        NightlyExtreme {
            kind,
            value: None,
            needs_reset: true,
        }
    }

    pub fn update(&mut self, value: f64, is_night: bool) {
        if !is_night {
            self.needs_reset = true;
            return;
        }
        if self.needs_reset {
            self.value = None;
            self.needs_reset = false;
        }
        if value.is_nan() {
            return;
        }
        self.value = Some(match (self.value, self.kind) {
            (None, _) => value,
            (Some(current), Extreme::Minimum) => current.min(value),
            (Some(current), Extreme::Maximum) => current.max(value),
        });
    }

    /// Start tonight's reduction from a backfilled value.
    pub fn seed(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.value = None;
        self.needs_reset = false;
        self.update(value, true);
    }

    /// The reduction so far, NaN if nothing has been seen.
    pub fn value(&self) -> f64 {
        self.value.unwrap_or(f64::NAN)
    }
}

/// Median of the finite values, `None` if there are none.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_and_young_histories_are_nan() {
        let mut wind = WindowedAverage::new(1800.0, 600.0);
        assert!(wind.average(1000.0).is_nan());

        wind.add(5.0, 1000.0);
        assert!(wind.average(1000.0).is_nan());
        assert!(wind.average(1599.0).is_nan());
        assert_abs_diff_eq!(wind.average(1600.0), 5.0);
    }

    #[test]
    fn average_of_retained_samples() {
        let mut wind = WindowedAverage::new(1800.0, 0.0);
        for (i, speed) in [100.0, 110.0, 110.0].into_iter().enumerate() {
            wind.add(speed, 1000.0 + i as f64);
        }
        assert_abs_diff_eq!(wind.average(1002.0), 106.666_666, epsilon = 1e-5);
    }

    #[test]
    fn old_samples_are_pruned_on_write_and_read() {
        let mut wind = WindowedAverage::new(100.0, 0.0);
        wind.add(1.0, 0.0);
        wind.add(2.0, 50.0);
        wind.add(3.0, 120.0);
        // 0.0 dropped on write, 50.0 still inside [20, 120]
        assert_eq!(wind.len(), 2);
        assert_abs_diff_eq!(wind.average(120.0), 2.5);
        assert_abs_diff_eq!(wind.average(175.0), 3.0);
        assert_eq!(wind.oldest(), Some(120.0));
        assert!(wind.average(500.0).is_nan());
        assert!(wind.is_empty());
    }

    #[test]
    fn late_samples_keep_history_ordered() {
        let mut wind = WindowedAverage::new(1000.0, 0.0);
        wind.add(1.0, 100.0);
        wind.add(3.0, 300.0);
        wind.add(2.0, 200.0);
        wind.add(f64::NAN, 250.0);
        assert_eq!(wind.oldest(), Some(100.0));
        assert_eq!(wind.len(), 3);

        let mut pruned = WindowedAverage::new(100.0, 0.0);
        pruned.add(1.0, 500.0);
        pruned.add(9.0, 100.0);
        assert_eq!(pruned.len(), 1);
        assert_abs_diff_eq!(pruned.average(500.0), 1.0);
    }

    #[test]
    fn retained_samples_stay_inside_window() {
        let mut wind = WindowedAverage::new(60.0, 0.0);
        for i in 0..500 {
            wind.add(f64::from(i % 7), f64::from(i) * 1.5);
            let now = f64::from(i) * 1.5;
            wind.average(now);
            assert!(wind.oldest().is_some_and(|t| t >= now - 60.0));
        }
    }

    #[test]
    fn nightly_minimum_resets_once_per_night() {
        let mut low = NightlyExtreme::new(Extreme::Minimum);
        assert!(low.value().is_nan());

        low.update(12.0, true);
        low.update(8.0, true);
        low.update(f64::NAN, true);
        low.update(10.0, true);
        assert_eq!(low.value(), 8.0);

        // Daytime samples leave last night's value readable.
        low.update(25.0, false);
        low.update(3.0, false);
        assert_eq!(low.value(), 8.0);

        low.update(14.0, true);
        assert_eq!(low.value(), 14.0);
        low.update(15.0, true);
        assert_eq!(low.value(), 14.0);
    }

    #[test]
    fn nightly_maximum_and_seed() {
        let mut high = NightlyExtreme::new(Extreme::Maximum);
        high.seed(4.0);
        high.update(2.0, true);
        assert_eq!(high.value(), 4.0);
        high.update(5.0, true);
        assert_eq!(high.value(), 5.0);
    }

    #[test]
    fn median_ignores_nan() {
        assert_eq!(median([]), None);
        assert_eq!(median([f64::NAN]), None);
        assert_eq!(median([3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median([4.0, 1.0, f64::NAN, 2.0, 3.0]), Some(2.5));
    }
}
