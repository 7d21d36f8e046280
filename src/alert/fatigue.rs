use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Re-emission spacing for an ongoing incident, in minutes
pub const ESCALATION_SCHEDULE_MIN: [i64; 5] = [1, 3, 5, 15, 30];

/// Per-fingerprint fatigue suppression: the first emission goes out
/// immediately, then re-emissions follow the escalation schedule and
/// never get more frequent while the incident lasts.
#[derive(Debug, Default)]
pub struct FatigueState {
    streak: usize,
    next_emit: Option<DateTime<Utc>>,
}

impl FatigueState {
    pub fn should_emit(&mut self, now: DateTime<Utc>) -> bool {
        match self.next_emit {
            Some(next) if now < next => false,
            _ => {
                let idx = self.streak.min(ESCALATION_SCHEDULE_MIN.len() - 1);
                self.next_emit =
                    Some(now + ChronoDuration::minutes(ESCALATION_SCHEDULE_MIN[idx]));
                self.streak += 1;
                true
            }
        }
    }
}

/// Token bucket rate limiter, one per fingerprint
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_minute: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    pub fn new(per_minute: u32, burst: u32, now: DateTime<Utc>) -> Self {
        let capacity = burst.max(1) as f64;
        Self { capacity, tokens: capacity, per_minute: per_minute.max(1) as f64, last_refill: now }
    }

    pub fn try_take(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = now
            .signed_duration_since(self.last_refill)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed / 60.0 * self.per_minute).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Fatigue and rate-limit state keyed by alert fingerprint
#[derive(Debug, Default)]
pub struct FatigueTracker {
    states: HashMap<u64, FatigueState>,
}

impl FatigueTracker {
    pub fn should_emit(&mut self, fingerprint: u64, now: DateTime<Utc>) -> bool {
        self.states.entry(fingerprint).or_default().should_emit(now)
    }

    /// Incident over; the next occurrence starts a fresh schedule.
    pub fn reset(&mut self, fingerprint: u64) {
        self.states.remove(&fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_spacing() {
        let mut state = FatigueState::default();
        let base = Utc::now();

        // first emission is immediate
        assert!(state.should_emit(base));
        // blocked until the 1-minute mark
        assert!(!state.should_emit(base + ChronoDuration::seconds(30)));
        assert!(state.should_emit(base + ChronoDuration::minutes(1)));
        // now spaced 3 minutes
        assert!(!state.should_emit(base + ChronoDuration::minutes(2)));
        assert!(state.should_emit(base + ChronoDuration::minutes(4)));
        // then 5
        assert!(state.should_emit(base + ChronoDuration::minutes(9)));
        // then 15
        assert!(!state.should_emit(base + ChronoDuration::minutes(14)));
        assert!(state.should_emit(base + ChronoDuration::minutes(24)));
    }

    #[test]
    fn test_thirty_minute_outage_bounded_emissions() {
        let mut state = FatigueState::default();
        let base = Utc::now();
        let mut emissions = 0;
        // evaluate every 5 seconds for 30 minutes, like the alert worker would
        for tick in 0..360 {
            if state.should_emit(base + ChronoDuration::seconds(tick * 5)) {
                emissions += 1;
            }
        }
        assert!(emissions <= 6, "got {emissions} emissions");
        assert!(emissions >= 4);
    }

    #[test]
    fn test_schedule_saturates_at_thirty() {
        let mut state = FatigueState::default();
        let base = Utc::now();
        let mut last_emit = None;
        for tick in 0..(6 * 60 * 12) {
            let now = base + ChronoDuration::seconds(tick * 5);
            if state.should_emit(now) {
                if let Some(prev) = last_emit {
                    let gap = now.signed_duration_since(prev);
                    assert!(gap <= ChronoDuration::minutes(31));
                }
                last_emit = Some(now);
            }
        }
    }

    #[test]
    fn test_token_bucket_burst_then_refill() {
        let base = Utc::now();
        let mut bucket = TokenBucket::new(10, 5, base);
        // burst capacity is 5
        for _ in 0..5 {
            assert!(bucket.try_take(base));
        }
        assert!(!bucket.try_take(base));
        // 6 seconds refills one token at 10/min
        assert!(bucket.try_take(base + ChronoDuration::seconds(6)));
        assert!(!bucket.try_take(base + ChronoDuration::seconds(6)));
    }

    #[test]
    fn test_token_bucket_window_bound() {
        let base = Utc::now();
        let mut bucket = TokenBucket::new(10, 5, base);
        let mut taken = 0;
        // hammer the bucket every 100ms for one minute
        for tick in 0..600 {
            if bucket.try_take(base + ChronoDuration::milliseconds(tick * 100)) {
                taken += 1;
            }
        }
        // burst + one minute of refill
        assert!(taken <= 15, "took {taken}");
    }

    #[test]
    fn test_tracker_reset_restarts_schedule() {
        let mut tracker = FatigueTracker::default();
        let base = Utc::now();
        assert!(tracker.should_emit(7, base));
        assert!(!tracker.should_emit(7, base + ChronoDuration::seconds(10)));
        tracker.reset(7);
        assert!(tracker.should_emit(7, base + ChronoDuration::seconds(20)));
    }
}
