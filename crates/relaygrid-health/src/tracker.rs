//! Link state from consecutive probe observations.

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No observation yet.
    Unknown,
    Up,
    Down,
}

/// Tracks consecutive observations for a single link.
#[derive(Debug)]
pub struct LinkTracker {
    status: LinkStatus,
    consecutive_dead: u32,
    /// Dead observations in a row before the link is down.
    dead_threshold: u32,
}

impl LinkTracker {
    pub fn new(dead_threshold: u32) -> Self {
        Self {
            status: LinkStatus::Unknown,
            consecutive_dead: 0,
            dead_threshold: dead_threshold.max(1),
        }
    }

    /// Record one observation and return the new status.
    pub fn record(&mut self, alive: bool) -> LinkStatus {
        if alive {
            if self.status == LinkStatus::Down {
                debug!(dead = self.consecutive_dead, "link recovered");
            }
            self.consecutive_dead = 0;
            self.status = LinkStatus::Up;
        } else {
            self.consecutive_dead += 1;
            if self.consecutive_dead >= self.dead_threshold && self.status != LinkStatus::Down {
                warn!(
                    dead = self.consecutive_dead,
                    threshold = self.dead_threshold,
                    "link marked down"
                );
                self.status = LinkStatus::Down;
            }
        }
        self.status
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn consecutive_dead(&self) -> u32 {
        self.consecutive_dead
    }

    /// Down only once the threshold was crossed.
    pub fn is_up(&self) -> bool {
        self.status != LinkStatus::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown() {
        let tracker = LinkTracker::new(3);
        assert_eq!(tracker.status(), LinkStatus::Unknown);
        assert!(tracker.is_up());
    }

    #[test]
    fn goes_down_after_threshold() {
        let mut tracker = LinkTracker::new(3);
        tracker.record(true);
        assert_eq!(tracker.record(false), LinkStatus::Up);
        assert_eq!(tracker.record(false), LinkStatus::Up);
        assert_eq!(tracker.record(false), LinkStatus::Down);
        assert!(!tracker.is_up());
        assert_eq!(tracker.consecutive_dead(), 3);
    }

    #[test]
    fn single_alive_recovers() {
        let mut tracker = LinkTracker::new(2);
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.status(), LinkStatus::Down);
        assert_eq!(tracker.record(true), LinkStatus::Up);
        assert_eq!(tracker.consecutive_dead(), 0);
    }

    #[test]
    fn alive_resets_the_count() {
        let mut tracker = LinkTracker::new(3);
        tracker.record(false);
        tracker.record(false);
        tracker.record(true);
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.status(), LinkStatus::Up);
    }

    #[test]
    fn zero_threshold_acts_as_one() {
        let mut tracker = LinkTracker::new(0);
        assert_eq!(tracker.record(false), LinkStatus::Down);
    }
}
