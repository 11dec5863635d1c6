use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Entries idle for this long are forgotten.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Per-client minimum interval between requests.
///
/// Each client address maps to the instant its last request was admitted.
/// A request is admitted when at least `min_interval` has passed since then;
/// rejected requests do not move the timestamp, so a client hammering the
/// server is let through again as soon as it backs off for the interval.
/// Bursts are rejected, never queued.
///
/// Clients are keyed by IP address alone. Keying by address and port would
/// give every new connection from the same client a fresh allowance.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use memserve_server::RateLimiter;
///
/// let limiter = RateLimiter::new(Duration::from_secs(1));
/// let client = "192.0.2.7".parse().unwrap();
/// assert!(limiter.check(client));
/// assert!(!limiter.check(client));
/// ```
pub struct RateLimiter {
    min_interval: Duration,
    window: Duration,
    last_admitted: Mutex<HashMap<IpAddr, Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            // Never forget a client that is still inside its interval.
            window: DEFAULT_WINDOW.max(min_interval),
            last_admitted: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a request from `client` arriving now.
    pub fn check(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    /// Admit or reject a request from `client` arriving at `now`.
    pub fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        let mut last_admitted = self.last_admitted.lock();
        last_admitted.retain(|_, last| now.saturating_duration_since(*last) < self.window);
        match last_admitted.get_mut(&client) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            Some(last) => {
                *last = now;
                true
            },
            None => {
                last_admitted.insert(client, now);
                true
            },
        }
    }

    /// Number of clients currently tracked.
    pub fn tracked(&self) -> usize {
        self.last_admitted.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_interval_scenario() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        let client = ip("10.0.0.1");
        assert!(limiter.check_at(client, start));
        assert!(!limiter.check_at(client, start + Duration::from_millis(500)));
        assert!(limiter.check_at(client, start + Duration::from_secs(1)));
    }

    #[test]
    fn test_rejection_does_not_reset_interval() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        let client = ip("10.0.0.1");
        assert!(limiter.check_at(client, start));
        assert!(!limiter.check_at(client, start + Duration::from_millis(900)));
        assert!(limiter.check_at(client, start + Duration::from_millis(1000)));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let now = Instant::now();
        assert!(limiter.check_at(ip("10.0.0.1"), now));
        assert!(limiter.check_at(ip("10.0.0.2"), now));
        assert!(limiter.check_at(ip("::1"), now));
        assert!(!limiter.check_at(ip("10.0.0.1"), now));
    }

    #[test]
    fn test_idle_clients_are_purged() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        limiter.check_at(ip("10.0.0.1"), start);
        limiter.check_at(ip("10.0.0.2"), start + Duration::from_secs(30));
        assert_eq!(limiter.tracked(), 2);
        limiter.check_at(ip("10.0.0.3"), start + DEFAULT_WINDOW);
        assert_eq!(limiter.tracked(), 2);
    }

    #[rstest]
    #[case(Duration::from_secs(1), DEFAULT_WINDOW)]
    #[case(Duration::from_secs(300), Duration::from_secs(300))]
    fn test_window_covers_interval(#[case] min_interval: Duration, #[case] window: Duration) {
        let limiter = RateLimiter::new(min_interval);
        assert_eq!(limiter.window, window);
        let start = Instant::now();
        let client = ip("10.0.0.1");
        assert!(limiter.check_at(client, start));
        assert!(!limiter.check_at(client, start + min_interval - Duration::from_millis(1)));
    }
}
