use crate::config::Config;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The upload may proceed; the admission has been recorded
    Admitted,
    /// The client is over its limit for the current window
    Rejected {
        /// Whole seconds until the oldest admission leaves the window
        retry_after_secs: u64,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Sliding-window admission counter keyed by client identity
///
/// Each identity keeps the timestamps of its admissions inside the trailing
/// window. Stale timestamps are pruned on every check, so there is no timer;
/// at most `limit` admissions succeed in any window of `window` length.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    /// Admission timestamps per client, oldest first
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` admissions per `window`
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Create a limiter from the service configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rate_limit.upload_limit, config.time_window())
    }

    /// Admit or reject one upload attempt from `client` at time `now`
    pub fn admit(&self, client: &str, now: Instant) -> Admission {
        let mut clients = self.clients.lock();
        let timestamps = clients.entry(client.to_string()).or_default();

        prune(timestamps, now, self.window);

        if timestamps.len() >= self.limit {
            // Non-empty here because limit is at least 1
            let oldest = timestamps.front().copied().unwrap_or(now);
            let remaining = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            let retry_after_secs = ceil_secs(remaining).clamp(1, ceil_secs(self.window).max(1));

            debug!(client = %client, retry_after_secs, "Upload rejected by rate limiter");
            return Admission::Rejected { retry_after_secs };
        }

        timestamps.push_back(now);
        trace!(client = %client, in_window = timestamps.len(), "Upload admitted");
        Admission::Admitted
    }

    /// Drop clients with no admissions left inside the window
    ///
    /// Returns the number of entries removed.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();

        clients.retain(|_, window| {
            prune(window, now, self.window);
            !window.is_empty()
        });

        before - clients.len()
    }

    /// Number of clients currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

/// Remove timestamps that are at least `window` old
fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = timestamps.front() {
        if now.saturating_duration_since(oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_first_upload_admitted_second_rejected() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();

        assert_eq!(limiter.admit("10.0.0.1", now), Admission::Admitted);

        match limiter.admit("10.0.0.1", now + Duration::from_secs(3)) {
            Admission::Rejected { retry_after_secs } => assert_eq!(retry_after_secs, 7),
            Admission::Admitted => panic!("Expected rejection inside the window"),
        }
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();

        assert!(limiter.admit("10.0.0.1", now).is_admitted());
        // Exactly one window later the old admission no longer counts
        assert!(limiter
            .admit("10.0.0.1", now + Duration::from_secs(10))
            .is_admitted());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();

        limiter.admit("client", now);
        let decision = limiter.admit("client", now + Duration::from_millis(9_500));

        assert_eq!(decision, Admission::Rejected { retry_after_secs: 1 });
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();

        assert!(limiter.admit("a", now).is_admitted());
        assert!(limiter.admit("b", now).is_admitted());
        assert!(!limiter.admit("a", now).is_admitted());
    }

    #[test]
    fn test_rejection_does_not_extend_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let now = Instant::now();

        assert!(limiter.admit("c", now).is_admitted());
        assert!(limiter.admit("c", now + Duration::from_secs(1)).is_admitted());
        assert!(!limiter.admit("c", now + Duration::from_secs(2)).is_admitted());
        // First admission has aged out, second still counts
        assert!(limiter.admit("c", now + Duration::from_secs(10)).is_admitted());
        assert!(!limiter.admit("c", now + Duration::from_secs(10)).is_admitted());
    }

    #[test]
    fn test_from_config_uses_window() {
        let mut config = Config::default();
        config.rate_limit.upload_limit = 2;
        config.rate_limit.time_window_secs = 3;
        let limiter = RateLimiter::from_config(&config);
        let now = Instant::now();

        assert!(limiter.admit("d", now).is_admitted());
        assert!(limiter.admit("d", now).is_admitted());
        assert_eq!(
            limiter.admit("d", now + Duration::from_secs(1)),
            Admission::Rejected { retry_after_secs: 2 }
        );
        assert!(limiter.admit("d", now + Duration::from_secs(3)).is_admitted());
    }

    #[test]
    fn test_purge_idle_drops_stale_clients() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();

        limiter.admit("old", now);
        limiter.admit("fresh", now + Duration::from_secs(8));
        assert_eq!(limiter.tracked_clients(), 2);

        let removed = limiter.purge_idle(now + Duration::from_secs(12));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_concurrent_admissions_for_one_client() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(10)));
        let now = Instant::now();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.admit("same-client", now).is_admitted())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 1);
    }

    proptest! {
        #[test]
        fn prop_at_most_limit_per_window(
            limit in 1usize..4,
            window_secs in 1u64..20,
            offsets in proptest::collection::vec(0u64..60_000, 1..64),
        ) {
            let limiter = RateLimiter::new(limit, Duration::from_secs(window_secs));
            let start = Instant::now();
            let window = Duration::from_secs(window_secs);

            let mut offsets = offsets;
            offsets.sort_unstable();

            let mut admitted: Vec<Instant> = Vec::new();
            for offset in offsets {
                let now = start + Duration::from_millis(offset);
                match limiter.admit("prop", now) {
                    Admission::Admitted => admitted.push(now),
                    Admission::Rejected { retry_after_secs } => {
                        prop_assert!(retry_after_secs > 0);
                        prop_assert!(retry_after_secs <= window_secs);
                    }
                }
            }

            for (i, &t) in admitted.iter().enumerate() {
                let in_window = admitted[i..]
                    .iter()
                    .take_while(|&&u| u.duration_since(t) < window)
                    .count();
                prop_assert!(in_window <= limit);
            }
        }
    }
}
