//! Per-hostname-per-hour ACME failure budget.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

pub struct FailureBudget {
    limit_per_hour: u32,
    failures: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl FailureBudget {
    pub fn new(limit_per_hour: u32) -> Self {
        Self {
            limit_per_hour,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed attempt for `hostname` at `now`.
    pub fn record_failure(&self, hostname: &str, now: DateTime<Utc>) {
        let mut failures = self.failures.lock().expect("failure budget lock poisoned");
        let entry = failures.entry(hostname.to_string()).or_default();
        entry.push(now);
        prune(entry, now);
    }

    /// Whether `hostname` has exhausted its failure budget for the current
    /// hour window; if so, the caller should wait out the window rather
    /// than attempt again.
    pub fn is_exhausted(&self, hostname: &str, now: DateTime<Utc>) -> bool {
        let mut failures = self.failures.lock().expect("failure budget lock poisoned");
        let Some(entry) = failures.get_mut(hostname) else {
            return false;
        };
        prune(entry, now);
        entry.len() as u32 >= self.limit_per_hour
    }
}

fn prune(timestamps: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) {
    timestamps.retain(|t| now - *t < chrono::Duration::hours(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_limit() {
        let budget = FailureBudget::new(2);
        let now = Utc::now();
        assert!(!budget.is_exhausted("example.com", now));
        budget.record_failure("example.com", now);
        assert!(!budget.is_exhausted("example.com", now));
        budget.record_failure("example.com", now);
        assert!(budget.is_exhausted("example.com", now));
    }

    #[test]
    fn window_expires_after_an_hour() {
        let budget = FailureBudget::new(1);
        let now = Utc::now();
        budget.record_failure("example.com", now);
        assert!(budget.is_exhausted("example.com", now));
        let later = now + chrono::Duration::hours(2);
        assert!(!budget.is_exhausted("example.com", later));
    }
}
