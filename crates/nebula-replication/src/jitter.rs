//! Inter-arrival jitter estimation for the interpolation engine.

use std::collections::VecDeque;

/// Exponentially weighted mean and variance of the spacing between sample
/// arrivals, plus a fixed window of the raw spacings.
#[derive(Debug, Clone)]
pub struct JitterEstimator {
    /// Recent inter-arrival spacings (seconds), oldest first.
    samples: VecDeque<f64>,
    /// Maximum number of spacings retained.
    max_samples: usize,
    /// EMA smoothing factor.
    alpha: f64,
    mean: f64,
    variance: f64,
    last_arrival: Option<f64>,
}

impl Default for JitterEstimator {
    fn default() -> Self {
        Self::new(20, 0.1)
    }
}

impl JitterEstimator {
    /// Estimator keeping `window` spacings and smoothing with `alpha`.
    pub fn new(window: usize, alpha: f64) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.max(1)),
            max_samples: window.max(1),
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            mean: 0.0,
            variance: 0.0,
            last_arrival: None,
        }
    }

    /// Record a sample arriving at local time `arrival`. Arrivals that go
    /// backwards in time are ignored.
    pub fn record_arrival(&mut self, arrival: f64) {
        let Some(last) = self.last_arrival.replace(arrival) else {
            return;
        };
        let spacing = arrival - last;
        if !spacing.is_finite() || spacing < 0.0 {
            self.last_arrival = Some(last);
            return;
        }

        if self.samples.is_empty() {
            self.mean = spacing;
            self.variance = 0.0;
        } else {
            let diff = spacing - self.mean;
            self.mean += self.alpha * diff;
            self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * diff * diff);
        }

        self.samples.push_back(spacing);
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Smoothed mean spacing (seconds).
    pub fn mean_spacing(&self) -> f64 {
        self.mean
    }

    /// Smoothed standard deviation of the spacing (seconds).
    pub fn jitter(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    /// Jitter as a fraction of the nominal send interval.
    pub fn normalized(&self, send_interval: f64) -> f64 {
        if send_interval > 0.0 {
            self.jitter() / send_interval
        } else {
            0.0
        }
    }

    /// Largest minus smallest spacing inside the window.
    pub fn window_spread(&self) -> f64 {
        let (min, max) = self
            .samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
                (lo.min(s), hi.max(s))
            });
        if self.samples.is_empty() { 0.0 } else { max - min }
    }

    /// Number of spacings currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.mean = 0.0;
        self.variance = 0.0;
        self.last_arrival = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_arrivals_have_no_jitter() {
        let mut est = JitterEstimator::new(20, 0.1);
        for i in 0..30 {
            est.record_arrival(i as f64 * 0.1);
        }
        assert!((est.mean_spacing() - 0.1).abs() < 1e-9);
        assert!(est.jitter() < 1e-9);
        assert_eq!(est.sample_count(), 20);
    }

    #[test]
    fn test_irregular_arrivals_raise_jitter() {
        let mut est = JitterEstimator::new(20, 0.2);
        let mut t = 0.0;
        for i in 0..40 {
            t += if i % 2 == 0 { 0.05 } else { 0.15 };
            est.record_arrival(t);
        }
        assert!(est.jitter() > 0.02, "jitter {}", est.jitter());
        assert!(est.normalized(0.1) > 0.2);
        assert!((est.window_spread() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_backwards_arrival_ignored() {
        let mut est = JitterEstimator::default();
        est.record_arrival(1.0);
        est.record_arrival(0.5);
        assert_eq!(est.sample_count(), 0);
        est.record_arrival(1.1);
        assert_eq!(est.sample_count(), 1);
        assert!((est.mean_spacing() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut est = JitterEstimator::default();
        est.record_arrival(0.0);
        est.record_arrival(0.3);
        est.reset();
        assert_eq!(est.sample_count(), 0);
        assert_eq!(est.jitter(), 0.0);
        assert_eq!(est.normalized(0.0), 0.0);
    }
}
