//! Deadline bookkeeping for the two blocking waits (request/response and
//! turn completion).
//!
//! ## State machine
//!
//! ```text
//! WAITING   → next poll interval available → poll for at most `idle`
//! EXPIRED   → overall deadline reached     → caller raises its timeout
//! ```
//!
//! A successful match or transport death is decided by the caller between
//! polls; this type only owns the clock. Progress notices fire at a fixed
//! cadence and never extend the deadline. A budget too large to represent as
//! an `Instant` never expires.

use std::time::{Duration, Instant};

/// Smallest poll interval handed out, so a nearly-expired wait still polls.
const MIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Keep waiting; poll for at most this long.
    Waiting(Duration),
    /// The overall deadline has passed.
    Expired,
}

/// Overall deadline split into bounded idle polls.
#[derive(Debug, Clone)]
pub struct IdleWait {
    started: Instant,
    /// `None` when `started + total` overflows.
    deadline: Option<Instant>,
    idle: Duration,
    progress_every: Duration,
    last_progress: Option<Instant>,
}

impl IdleWait {
    pub fn new(total: Duration, idle: Duration, progress_every: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started.checked_add(total),
            idle: idle.max(MIN_POLL),
            progress_every,
            last_progress: None,
        }
    }

    pub fn state(&self) -> WaitState {
        let Some(deadline) = self.deadline else {
            return WaitState::Waiting(self.idle);
        };
        let now = Instant::now();
        if now >= deadline {
            return WaitState::Expired;
        }
        WaitState::Waiting(self.idle.min(deadline - now).max(MIN_POLL))
    }

    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Call after an idle poll. Returns the remaining time when a progress
    /// notice is due, and records that it was emitted.
    pub fn progress_due(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let due = match self.last_progress {
            None => true,
            Some(last) => now.duration_since(last) >= self.progress_every,
        };
        if !due {
            return None;
        }
        self.last_progress = Some(now);
        Some(self.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_is_bounded_by_idle() {
        let wait = IdleWait::new(
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(15),
        );
        assert_eq!(wait.state(), WaitState::Waiting(Duration::from_secs(5)));
    }

    #[test]
    fn poll_interval_shrinks_near_deadline() {
        let wait = IdleWait::new(
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_secs(15),
        );
        match wait.state() {
            WaitState::Waiting(poll) => assert!(poll <= Duration::from_secs(2)),
            WaitState::Expired => panic!("should not be expired yet"),
        }
    }

    #[test]
    fn zero_budget_is_expired() {
        let wait = IdleWait::new(Duration::ZERO, Duration::from_secs(1), Duration::from_secs(15));
        assert_eq!(wait.state(), WaitState::Expired);
        assert_eq!(wait.remaining(), Duration::ZERO);
    }

    #[test]
    fn unrepresentable_budget_never_expires() {
        let wait = IdleWait::new(
            Duration::from_secs(u64::MAX),
            Duration::from_millis(100),
            Duration::from_secs(15),
        );
        assert_eq!(wait.state(), WaitState::Waiting(Duration::from_millis(100)));
        assert_eq!(wait.remaining(), Duration::MAX);

        let wait = IdleWait::new(Duration::MAX, Duration::MAX, Duration::MAX);
        assert!(matches!(wait.state(), WaitState::Waiting(_)));
    }

    #[test]
    fn progress_fires_once_per_cadence() {
        let mut wait = IdleWait::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(15),
        );
        assert!(wait.progress_due().is_some());
        assert!(wait.progress_due().is_none());
        assert!(wait.elapsed() < Duration::from_secs(15));
    }

    #[test]
    fn progress_does_not_extend_deadline() {
        let mut wait = IdleWait::new(
            Duration::from_millis(30),
            Duration::from_millis(10),
            Duration::ZERO,
        );
        while wait.state() != WaitState::Expired {
            let _ = wait.progress_due();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(wait.elapsed() >= Duration::from_millis(30));
    }
}
