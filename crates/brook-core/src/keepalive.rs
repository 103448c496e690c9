//! Keep-alive timers.
//!
//! Both are plain deadlines that the owner polls with the current time, so
//! the I/O loop decides how it waits and tests can move time by hand.

use std::time::{Duration, Instant};

/// Receive-side timeout: the peer is dead if no packet arrives within one and
/// a half keep-alive periods (MQTT-3.1.2-24). A keep-alive of 0 disables it.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    timeout: Option<Duration>,
    last_activity: Instant,
}

impl KeepAlive {
    pub fn new(keep_alive_secs: u16, now: Instant) -> Self {
        let timeout = (keep_alive_secs > 0)
            .then(|| Duration::from_millis(u64::from(keep_alive_secs) * 1500));
        Self {
            timeout,
            last_activity: now,
        }
    }

    /// A timer that never expires.
    pub fn disabled(now: Instant) -> Self {
        Self::new(0, now)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Restart the timeout after a complete packet was received.
    pub fn restart(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.last_activity + timeout)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }
}

/// Send-side cadence: a PINGREQ every keep-alive period.
#[derive(Debug, Clone)]
pub struct PingTimer {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl PingTimer {
    pub fn new(keep_alive_secs: u16, now: Instant) -> Self {
        let interval = (keep_alive_secs > 0).then(|| Duration::from_secs(keep_alive_secs.into()));
        Self {
            interval,
            next: interval.map(|interval| now + interval),
        }
    }

    /// An idle timer (before CONNACK, or keep-alive 0).
    pub fn stopped() -> Self {
        Self {
            interval: None,
            next: None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next
    }

    /// True once per elapsed interval; re-arms itself.
    pub fn poll(&mut self, now: Instant) -> bool {
        match (self.next, self.interval) {
            (Some(next), Some(interval)) if now >= next => {
                self.next = Some(now + interval);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_one_and_a_half_periods() {
        let start = Instant::now();
        let keep_alive = KeepAlive::new(10, start);
        assert_eq!(keep_alive.timeout(), Some(Duration::from_secs(15)));
        assert!(!keep_alive.is_expired(start + Duration::from_secs(14)));
        assert!(keep_alive.is_expired(start + Duration::from_secs(15)));
    }

    #[test]
    fn test_restart_moves_deadline() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(2, start);
        keep_alive.restart(start + Duration::from_secs(2));
        assert!(!keep_alive.is_expired(start + Duration::from_secs(4)));
        assert!(keep_alive.is_expired(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_disables() {
        let start = Instant::now();
        let keep_alive = KeepAlive::new(0, start);
        assert_eq!(keep_alive.deadline(), None);
        assert!(!keep_alive.is_expired(start + Duration::from_secs(1_000_000)));
        assert!(!KeepAlive::disabled(start).is_expired(start));
    }

    #[test]
    fn test_ping_timer_fires_each_interval() {
        let start = Instant::now();
        let mut timer = PingTimer::new(5, start);
        assert!(!timer.poll(start + Duration::from_secs(4)));
        assert!(timer.poll(start + Duration::from_secs(5)));
        assert!(!timer.poll(start + Duration::from_secs(6)));
        assert!(timer.poll(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_stopped_ping_timer() {
        let mut timer = PingTimer::stopped();
        assert_eq!(timer.deadline(), None);
        assert!(!timer.poll(Instant::now()));
        assert!(!PingTimer::new(0, Instant::now()).poll(Instant::now()));
    }
}
