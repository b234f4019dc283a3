//! Time sources.
//!
//! Timestamps on records are informational ordering aids; `sequence` is
//! authoritative. The authority timestamp is the median of independent
//! sources and is only recorded when at least two sources respond — a lone
//! clock is never promoted to an authority.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A named source of the current time.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Stable identifier of this source.
    fn source_id(&self) -> &str;
}

/// The local system clock.
pub struct SystemClock;

impl TimeSource for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // millis fit in u64 for ~584M years
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn source_id(&self) -> &str {
        "system"
    }
}

/// Combines independent time sources into a median authority time.
pub struct AuthorityClock {
    sources: Vec<Arc<dyn TimeSource>>,
}

impl AuthorityClock {
    /// Creates an authority clock over the given sources.
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn TimeSource>>) -> Self {
        Self { sources }
    }

    /// Creates an authority clock with no sources (authority time absent).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Returns the median of the configured sources, or `None` when fewer
    /// than two sources are configured.
    #[must_use]
    pub fn authority_now_ms(&self) -> Option<u64> {
        if self.sources.len() < 2 {
            return None;
        }
        let mut samples: Vec<u64> = self.sources.iter().map(|s| s.now_ms()).collect();
        samples.sort_unstable();
        Some(samples[samples.len() / 2])
    }

    /// Number of configured sources.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(u64, &'static str);

    impl TimeSource for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }

        fn source_id(&self) -> &str {
            self.1
        }
    }

    #[test]
    fn single_source_is_not_an_authority() {
        let clock = AuthorityClock::new(vec![Arc::new(FixedClock(100, "a"))]);
        assert_eq!(clock.authority_now_ms(), None);
    }

    #[test]
    fn median_of_three_sources() {
        let clock = AuthorityClock::new(vec![
            Arc::new(FixedClock(90, "a")),
            Arc::new(FixedClock(100, "b")),
            Arc::new(FixedClock(5_000, "skewed")),
        ]);
        assert_eq!(clock.authority_now_ms(), Some(100));
    }

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        assert!(clock.now_ms() > 1_600_000_000_000);
        assert_eq!(clock.source_id(), "system");
    }
}
