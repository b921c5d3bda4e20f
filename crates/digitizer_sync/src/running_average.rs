//! A running average filter with periodic recomputation to bound floating-point drift.
//!
//! The streaming poll loop's watchdog tracks an estimate of the incoming sample rate by feeding
//! inter-sample timestamps through one of these; it compares the estimate against a threshold
//! fraction of the configured rate to decide whether the driver has stopped producing data.

/// Every this many samples, the average is recomputed from scratch instead of incrementally
/// updated, to bound accumulated floating point error.
const RECOMPUTE_INTERVAL: u64 = 100_000;

/// An incrementally maintained running average of the last `window` values pushed into it.
///
/// Mirrors the original driver's `average_filter<T>`: rather than keeping the full window and
/// summing it on every recompute, each [`RunningAverage::add`] call updates the average in O(1)
/// by subtracting the contribution of the value it displaces and adding the new one. Because
/// this is an incremental update, floating point error accumulates over time, so the average is
/// fully recomputed from the retained window every [`RECOMPUTE_INTERVAL`] pushes.
pub struct RunningAverage {
    window: Vec<f64>,
    write_pos: usize,
    filled: usize,
    average: f64,
    pushes_since_recompute: u64,
}

impl RunningAverage {
    /// Creates a filter averaging over the last `window_len` values. `window_len` must be
    /// nonzero.
    pub fn new(window_len: usize) -> Self {
        assert!(window_len != 0, "window_len must be nonzero");
        Self {
            window: vec![0.0; window_len],
            write_pos: 0,
            filled: 0,
            average: 0.0,
            pushes_since_recompute: 0,
        }
    }

    /// Pushes a new value, updating the running average.
    pub fn add(&mut self, value: f64) {
        let len = self.window.len();
        if self.filled < len {
            let n = self.filled as f64;
            self.average = (self.average * n + value) / (n + 1.0);
            self.window[self.write_pos] = value;
            self.filled += 1;
        } else {
            let old = self.window[self.write_pos];
            let n = len as f64;
            self.average = (self.average * n - old + value) / n;
            self.window[self.write_pos] = value;
        }
        self.write_pos = (self.write_pos + 1) % len;

        self.pushes_since_recompute += 1;
        if self.pushes_since_recompute >= RECOMPUTE_INTERVAL {
            self.recompute();
            self.pushes_since_recompute = 0;
        }
    }

    /// Returns the current average, or `0.0` if nothing has been pushed yet.
    pub fn get_avg_value(&self) -> f64 {
        self.average
    }

    fn recompute(&mut self) {
        if self.filled == 0 {
            self.average = 0.0;
            return;
        }
        let sum: f64 = self.window[..self.filled].iter().sum();
        self.average = sum / self.filled as f64;
    }
}
