//! Timed reconnection for stream links.
//!
//! The supervisor owns the retry timer and the "attempt pending" flag. The
//! handler decides when the link went down; the supervisor only decides
//! whether and when to try again.
//!
//! ```text
//! link down / connect failed ──auto_reconnect──> timer running
//!        ▲                                            │ tick
//!        │                                            ▼
//!        └──────────── attempt failed ───────── connect attempt
//!                                                     │ link up
//!                                                     ▼
//!                                               timer stopped
//! ```

use super::timer::{Timer, TimerState};
use std::time::Duration;

/// Retry timer plus the bookkeeping around it.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    timer: Timer,
    auto_reconnect: bool,
    attempting: bool,
    timeout: Option<Duration>,
}

impl ReconnectSupervisor {
    pub fn new(retry: Duration, auto_reconnect: bool, timeout: Option<Duration>) -> Self {
        Self {
            timer: Timer::periodic(retry),
            auto_reconnect,
            attempting: false,
            timeout,
        }
    }

    /// Resume the retry timer if enabled and not already running.
    /// Returns true when the timer is (now) counting towards an attempt.
    pub fn arm(&mut self) -> bool {
        if !self.auto_reconnect {
            return false;
        }
        if self.timer.state() != TimerState::Running {
            self.timer.resume();
        }
        true
    }

    /// The link came up: nothing left to retry.
    pub fn link_up(&mut self) {
        self.attempting = false;
        self.timer.stop();
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        if !enabled {
            self.timer.stop();
        }
    }

    #[must_use]
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// True while the link is known down and a retry is expected.
    #[must_use]
    pub fn attempting(&self) -> bool {
        self.attempting
    }

    pub fn set_attempting(&mut self, attempting: bool) {
        self.attempting = attempting;
    }

    /// Per-attempt connect timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    #[must_use]
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn arm_runs_retry_timer_once() {
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(5), true, None);
        assert!(supervisor.arm());
        assert_eq!(supervisor.timer().state(), TimerState::Running);

        let start = tokio::time::Instant::now();
        supervisor.timer_mut().tick().await;
        // Re-arming a running timer keeps its schedule.
        tokio::time::advance(Duration::from_secs(2)).await;
        supervisor.arm();
        supervisor.timer_mut().tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn disabled_never_arms() {
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(5), false, None);
        assert!(!supervisor.arm());
        assert_eq!(supervisor.timer().state(), TimerState::Stopped);
    }

    #[test]
    fn link_up_clears_attempt() {
        let mut supervisor = ReconnectSupervisor::new(Duration::from_secs(5), true, None);
        supervisor.set_attempting(true);
        supervisor.arm();
        supervisor.link_up();
        assert!(!supervisor.attempting());
        assert_eq!(supervisor.timer().state(), TimerState::Stopped);
    }
}
