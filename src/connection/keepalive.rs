//! Missed-response accounting for the keep-alive poller.

/// Requests sent since the last accepted response.
///
/// The link is judged dead once the count exceeds the limit, so a limit of
/// 3 tolerates three unanswered sends and trips on the fourth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCounter {
    count: u32,
    limit: u32,
}

impl SendCounter {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self { count: 0, limit }
    }

    /// Count one send. Returns true when the count now exceeds the limit.
    pub fn record(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.exceeded()
    }

    #[must_use]
    pub fn exceeded(&self) -> bool {
        self.count > self.limit
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Jump past the limit, as after a failed connect attempt.
    pub fn force_exceeded(&mut self) {
        self.count = self.limit.saturating_add(1);
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_limit() {
        let mut counter = SendCounter::new(3);
        assert!(!counter.record());
        assert!(!counter.record());
        assert!(!counter.record());
        assert!(counter.record());
        assert_eq!(counter.count(), 4);

        counter.reset();
        assert!(!counter.exceeded());
    }

    #[test]
    fn forced_past_limit() {
        let mut counter = SendCounter::new(15);
        counter.force_exceeded();
        assert_eq!(counter.count(), 16);
        assert!(counter.exceeded());
    }
}
