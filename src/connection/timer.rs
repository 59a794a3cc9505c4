//! Restartable periodic / one-shot timer driven by `tokio::time`.
//!
//! A [`Timer`] is owned by the handler that polls it. It never spawns a task:
//! the owner awaits [`Timer::tick`] inside its own `select!`, which keeps all
//! state changes on the handler task.

use std::time::Duration;
use tokio::time::Instant;

/// Run state of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Counting towards the next tick.
    Running,
    /// Halted with the remaining time kept for `resume`.
    Paused,
    /// Halted; the next `resume` waits a full interval.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Periodic,
    OneShot,
}

/// Cancelable timer with Running / Paused / Stopped states.
#[derive(Debug)]
pub struct Timer {
    mode: Mode,
    interval: Duration,
    state: TimerState,
    deadline: Instant,
    remaining: Duration,
    count: u64,
}

impl Timer {
    /// Periodic timer, created stopped.
    pub fn periodic(interval: Duration) -> Self {
        Self::new(Mode::Periodic, interval)
    }

    /// One-shot timer, created stopped.
    pub fn one_shot(interval: Duration) -> Self {
        Self::new(Mode::OneShot, interval)
    }

    fn new(mode: Mode, interval: Duration) -> Self {
        Self {
            mode,
            interval,
            state: TimerState::Stopped,
            deadline: Instant::now(),
            remaining: interval,
            count: 0,
        }
    }

    /// Start in the paused state with a full interval remaining.
    #[must_use]
    pub fn paused(mut self) -> Self {
        self.state = TimerState::Paused;
        self.remaining = self.interval;
        self
    }

    /// Zero the tick count and run from now.
    pub fn restart(&mut self) {
        self.count = 0;
        self.deadline = Instant::now() + self.interval;
        self.state = TimerState::Running;
    }

    /// Halt, keeping the time left until the next tick.
    pub fn pause(&mut self) {
        if self.state == TimerState::Running {
            self.remaining = self.deadline.saturating_duration_since(Instant::now());
            self.state = TimerState::Paused;
        }
    }

    /// Continue after `pause`, or start a full interval after `stop`.
    pub fn resume(&mut self) {
        let wait = match self.state {
            TimerState::Running => return,
            TimerState::Paused => self.remaining,
            TimerState::Stopped => self.interval,
        };
        self.deadline = Instant::now() + wait;
        self.state = TimerState::Running;
    }

    /// Halt and zero the tick count.
    pub fn stop(&mut self) {
        self.state = TimerState::Stopped;
        self.count = 0;
        self.remaining = self.interval;
    }

    /// Change the interval. Takes effect from the next schedule.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Ticks since the last `restart` or `stop`.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next tick and return the new tick count.
    ///
    /// Pending forever while not running. Cancel safe: dropping the future
    /// before it completes leaves the schedule untouched.
    pub async fn tick(&mut self) -> u64 {
        if self.state != TimerState::Running {
            return std::future::pending().await;
        }
        tokio::time::sleep_until(self.deadline).await;

        self.count += 1;
        match self.mode {
            Mode::Periodic => {
                let next = self.deadline + self.interval;
                let now = Instant::now();
                self.deadline = if next > now { next } else { now + self.interval };
            }
            Mode::OneShot => {
                self.state = TimerState::Stopped;
                self.remaining = self.interval;
            }
        }
        self.count
    }
}

/// Tick an optional timer; pending forever when absent.
pub(crate) async fn tick_optional(timer: Option<&mut Timer>) -> u64 {
    match timer {
        Some(timer) => timer.tick().await,
        None => std::future::pending().await,
    }
}
