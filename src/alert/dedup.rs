use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::alert::AlertKind;

/// Outcome of a dedup check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Fresh,
    /// Number of occurrences suppressed so far, this one included
    Duplicate(u32),
}

#[derive(Debug)]
struct DedupEntry {
    kind: AlertKind,
    message: String,
    last_seen: DateTime<Utc>,
    count: u32,
}

/// Fingerprint-window deduplication with near-duplicate detection:
/// same-kind messages whose case-folded word sets overlap at or above
/// the Jaccard threshold collapse into the cached entry.
#[derive(Debug)]
pub struct Deduplicator {
    window: ChronoDuration,
    similarity_threshold: f64,
    entries: HashMap<u64, DedupEntry>,
}

impl Deduplicator {
    pub fn new(window: std::time::Duration, similarity_threshold: f64) -> Self {
        Self {
            window: ChronoDuration::from_std(window)
                .unwrap_or_else(|_| ChronoDuration::seconds(300)),
            similarity_threshold,
            entries: HashMap::new(),
        }
    }

    pub fn observe(
        &mut self,
        fingerprint: u64,
        kind: AlertKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> DedupDecision {
        self.evict(now);

        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            entry.last_seen = entry.last_seen.max(now);
            entry.count += 1;
            return DedupDecision::Duplicate(entry.count);
        }

        // near-duplicate: same kind, message close enough
        let similar = self
            .entries
            .values_mut()
            .find(|e| e.kind == kind && jaccard(&e.message, message) >= self.similarity_threshold);
        if let Some(entry) = similar {
            entry.last_seen = entry.last_seen.max(now);
            entry.count += 1;
            return DedupDecision::Duplicate(entry.count);
        }

        self.entries.insert(
            fingerprint,
            DedupEntry { kind, message: message.to_string(), last_seen: now, count: 0 },
        );
        DedupDecision::Fresh
    }

    pub fn forget(&mut self, fingerprint: u64) {
        self.entries.remove(&fingerprint);
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.entries.retain(|_, e| now.signed_duration_since(e.last_seen) <= window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Jaccard similarity over case-folded whitespace-split word tokens
pub fn jaccard(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let set_a: std::collections::HashSet<String> =
        a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let set_b: std::collections::HashSet<String> =
        b.to_lowercase().split_whitespace().map(str::to_string).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}
