//! Per-provider circuit pause
//!
//! Owned by the single backfill worker for the duration of one run; a new run
//! starts from a fresh breaker.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::types::SourceAttemptOutcome;

/// Consecutive-failure counters and pause windows keyed by provider name
#[derive(Debug)]
pub struct ProviderBreaker {
    threshold: u32,
    pause: Duration,
    failures: HashMap<String, u32>,
    paused_until: HashMap<String, Instant>,
}

impl ProviderBreaker {
    pub fn new(threshold: u32, pause: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            pause,
            failures: HashMap::new(),
            paused_until: HashMap::new(),
        }
    }

    /// Remaining pause for `source`, if it is paused right now
    pub fn paused_for(&mut self, source: &str) -> Option<Duration> {
        let until = *self.paused_until.get(source)?;
        let now = Instant::now();
        if until > now {
            Some(until - now)
        } else {
            self.paused_until.remove(source);
            None
        }
    }

    /// Fold one attempt outcome into the provider's state.
    ///
    /// Returns true when this failure opened the pause window.
    pub fn record(&mut self, source: &str, outcome: SourceAttemptOutcome) -> bool {
        match outcome {
            SourceAttemptOutcome::Success | SourceAttemptOutcome::NotFound => {
                self.failures.remove(source);
                false
            }
            SourceAttemptOutcome::Skipped => false,
            SourceAttemptOutcome::Failure => {
                let count = self.failures.entry(source.to_string()).or_insert(0);
                *count += 1;
                if *count >= self.threshold {
                    self.failures.remove(source);
                    self.paused_until
                        .insert(source.to_string(), Instant::now() + self.pause);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn consecutive_failures(&self, source: &str) -> u32 {
        self.failures.get(source).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covers::types::SourceAttemptOutcome::*;

    const SOURCE: &str = "GOOGLE_BOOKS";

    #[tokio::test(start_paused = true)]
    async fn test_trips_at_threshold_and_resets_counter() {
        let mut breaker = ProviderBreaker::new(3, Duration::from_secs(60));

        assert!(!breaker.record(SOURCE, Failure));
        assert!(!breaker.record(SOURCE, Failure));
        assert!(breaker.record(SOURCE, Failure));

        assert_eq!(breaker.consecutive_failures(SOURCE), 0);
        assert!(breaker.paused_for(SOURCE).is_some());
        assert!(breaker.paused_for("OPEN_LIBRARY").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_expires() {
        let mut breaker = ProviderBreaker::new(1, Duration::from_secs(60));
        breaker.record(SOURCE, Failure);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.paused_for(SOURCE).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(breaker.paused_for(SOURCE).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_and_not_found_reset_but_skip_does_not() {
        let mut breaker = ProviderBreaker::new(3, Duration::from_secs(60));

        breaker.record(SOURCE, Failure);
        breaker.record(SOURCE, Failure);
        breaker.record(SOURCE, NotFound);
        assert_eq!(breaker.consecutive_failures(SOURCE), 0);

        breaker.record(SOURCE, Failure);
        breaker.record(SOURCE, Success);
        assert_eq!(breaker.consecutive_failures(SOURCE), 0);

        breaker.record(SOURCE, Failure);
        breaker.record(SOURCE, Skipped);
        assert_eq!(breaker.consecutive_failures(SOURCE), 1);
    }
}
