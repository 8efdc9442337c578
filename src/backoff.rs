//! Adaptive idle backoff
//!
//! Both the poll loop and the completion worker sleep between cycles that
//! produced no work. The sleep starts at zero, jumps to 1 ms on the first
//! unproductive cycle, doubles on each further one, and saturates at a
//! configured cap; any productive cycle resets it to zero. This keeps the
//! loops from busy-spinning while idle yet restores sub-millisecond
//! latency as soon as traffic returns.

use std::thread;
use std::time::Duration;

const INITIAL_STEP: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(max: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            max,
        }
    }

    /// The current wait, used as a blocking-dequeue timeout.
    pub(crate) fn wait(&self) -> Duration {
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    pub(crate) fn grow(&mut self) {
        self.current = if self.current.is_zero() {
            INITIAL_STEP.min(self.max)
        } else {
            (self.current * 2).min(self.max)
        };
    }

    /// One loop-tail step: reset on productive cycles, otherwise grow and
    /// sleep for the current interval.
    pub(crate) fn pause(&mut self, productive: bool) {
        if productive {
            self.reset();
            return;
        }
        self.grow();
        if !self.current.is_zero() {
            thread::sleep(self.current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_one_ms_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(8));
        assert_eq!(backoff.wait(), Duration::ZERO);

        let expected_ms = [1, 2, 4, 8, 8];
        for ms in expected_ms {
            backoff.grow();
            assert_eq!(backoff.wait(), Duration::from_millis(ms));
        }
    }

    #[test]
    fn test_reset_on_productive_cycle() {
        let mut backoff = Backoff::new(Duration::from_millis(250));
        backoff.grow();
        backoff.grow();
        backoff.pause(true);
        assert_eq!(backoff.wait(), Duration::ZERO);
    }

    #[test]
    fn test_bounded_by_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(3));
        for _ in 0..20 {
            backoff.grow();
        }
        assert_eq!(backoff.wait(), Duration::from_millis(3));
    }
}
