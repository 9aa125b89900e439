//! Per-user sliding rate window

use crate::config::AbuseConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Which rate limit a message broke
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateViolation {
    PerMinute,
    PerHour,
    TooFast,
}

impl RateViolation {
    pub fn label(&self) -> &'static str {
        match self {
            RateViolation::PerMinute => "per_minute",
            RateViolation::PerHour => "per_hour",
            RateViolation::TooFast => "min_interval",
        }
    }
}

/// Recent accepted messages of one user plus their punishment state.
///
/// Created lazily on the first event, evicted after an idle TTL.
#[derive(Debug)]
pub struct RateWindow {
    /// Accepted message times, oldest first, at most one hour old
    accepted: VecDeque<Instant>,

    /// Text of the user's previous message
    pub(crate) last_text: Option<String>,

    /// Warnings since the last restriction
    pub(crate) warnings: u32,

    /// Restrictions applied so far (drives the escalation ladder)
    pub(crate) offenses: u32,

    /// End of the current restriction
    pub(crate) punished_until: Option<Instant>,

    /// Restriction is enforced locally because the platform could not apply it
    pub(crate) banned_locally: bool,

    /// Last event of any kind
    pub(crate) last_seen: Instant,
}

impl RateWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            accepted: VecDeque::new(),
            last_text: None,
            warnings: 0,
            offenses: 0,
            punished_until: None,
            banned_locally: false,
            last_seen: now,
        }
    }

    /// Drop timestamps older than the hourly window
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.accepted.front() {
            if now.saturating_duration_since(*front) >= HOUR {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Accepted messages within the trailing `window`
    pub fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.accepted
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    /// Would accepting a message at `now` break a limit?
    pub fn violation(&self, now: Instant, config: &AbuseConfig) -> Option<RateViolation> {
        if let Some(last) = self.accepted.back() {
            let gap = now.saturating_duration_since(*last);
            if gap < Duration::from_millis(config.min_interval_ms) {
                return Some(RateViolation::TooFast);
            }
        }
        if self.count_within(now, MINUTE) + 1 > config.max_per_minute as usize {
            return Some(RateViolation::PerMinute);
        }
        if self.count_within(now, HOUR) + 1 > config.max_per_hour as usize {
            return Some(RateViolation::PerHour);
        }
        None
    }

    pub fn record_accept(&mut self, now: Instant) {
        self.accepted.push_back(now);
    }

    pub fn is_punished(&self, now: Instant) -> bool {
        self.punished_until.is_some_and(|until| now < until)
    }

    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    pub fn offenses(&self) -> u32 {
        self.offenses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_cap() {
        let config = AbuseConfig::default();
        let t0 = Instant::now();
        let mut window = RateWindow::new(t0);

        for i in 0..10 {
            let now = t0 + Duration::from_secs(i * 2);
            assert_eq!(window.violation(now, &config), None);
            window.record_accept(now);
        }
        assert_eq!(
            window.violation(t0 + Duration::from_secs(20), &config),
            Some(RateViolation::PerMinute)
        );
        // First message leaves the trailing minute
        assert_eq!(window.violation(t0 + Duration::from_secs(60), &config), None);
    }

    #[test]
    fn test_min_interval() {
        let config = AbuseConfig::default();
        let t0 = Instant::now();
        let mut window = RateWindow::new(t0);
        window.record_accept(t0);

        assert_eq!(
            window.violation(t0 + Duration::from_millis(999), &config),
            Some(RateViolation::TooFast)
        );
        assert_eq!(window.violation(t0 + Duration::from_millis(1000), &config), None);
    }

    #[test]
    fn test_hour_cap_and_prune() {
        let config = AbuseConfig {
            max_per_minute: 10,
            max_per_hour: 12,
            ..Default::default()
        };
        let t0 = Instant::now();
        let mut window = RateWindow::new(t0);

        for i in 0..12 {
            window.record_accept(t0 + Duration::from_secs(i * 30));
        }
        let later = t0 + Duration::from_secs(12 * 30);
        assert_eq!(window.violation(later, &config), Some(RateViolation::PerHour));

        window.prune(t0 + Duration::from_secs(3600 + 90));
        assert_eq!(window.count_within(t0 + Duration::from_secs(3690), HOUR), 8);
    }
}
