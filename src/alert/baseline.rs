use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Hard cap so a tiny interval cannot grow the buffer without bound
const MAX_SAMPLES: usize = 10_000;

/// Rolling baseline for one watched metric. Until warm-up completes the
/// static threshold applies; afterwards thresholds come from μ + k·σ
/// (or the 95th percentile for loss-like metrics), clamped to a sane
/// band around the static default.
#[derive(Debug)]
pub struct AdaptiveBaseline {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    window: ChronoDuration,
    min_samples: usize,
}

impl AdaptiveBaseline {
    pub fn new(window_hours: u32, min_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window: ChronoDuration::hours(window_hours.max(1) as i64),
            min_samples: min_samples.max(1),
        }
    }

    pub fn push(&mut self, now: DateTime<Utc>, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.samples.push_back((now, value));
        let cutoff = now - self.window;
        while let Some((at, _)) = self.samples.front() {
            if *at < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn warmed_up(&self) -> bool {
        self.samples.len() >= self.min_samples
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| v).sum::<f64>() / self.samples.len() as f64
    }

    pub fn stdev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|(_, v)| (v - mean).powi(2))
            .sum::<f64>()
            / self.samples.len() as f64;
        variance.sqrt()
    }

    pub fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((values.len() as f64) * 0.95).ceil() as usize;
        values[rank.saturating_sub(1).min(values.len() - 1)]
    }

    /// μ + k·σ threshold, clamped to [half, five times] the static
    /// default; static until warm-up completes.
    pub fn threshold_sigma(&self, static_default: f64, sigma: f64) -> f64 {
        if !self.warmed_up() {
            return static_default;
        }
        (self.mean() + sigma * self.stdev()).clamp(static_default * 0.5, static_default * 5.0)
    }

    /// 95th-percentile threshold with the same clamping rule.
    pub fn threshold_p95(&self, static_default: f64) -> f64 {
        if !self.warmed_up() {
            return static_default;
        }
        self.p95().clamp(static_default * 0.5, static_default * 5.0)
    }
}
