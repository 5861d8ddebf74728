//! Restartable countdown timer used by the cooperative components.

use std::time::{Duration, Instant};

/// A countdown timer compared against the wall clock on demand.
///
/// The timer never fires on its own; callers probe [`Timer::is_timed_out`]
/// from their `process()` tick.
#[derive(Debug, Clone)]
pub struct Timer {
    timeout: Duration,
    started_at: Option<Instant>,
}

impl Timer {
    /// Create a stopped timer with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started_at: None,
        }
    }

    /// Change the timeout. Takes effect on the next start.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Get the configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start (or restart) the countdown.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stop the countdown. A stopped timer never times out.
    pub fn stop(&mut self) {
        self.started_at = None;
    }

    /// Check if the timer is running.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Check if the countdown elapsed. Always false when stopped.
    pub fn is_timed_out(&self) -> bool {
        match self.started_at {
            Some(t0) => t0.elapsed() >= self.timeout,
            None => false,
        }
    }

    /// Time elapsed since start, if running.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t0| t0.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_states() {
        let mut timer = Timer::new(Duration::from_millis(50));
        assert!(!timer.is_running());
        assert!(!timer.is_timed_out());

        timer.start();
        assert!(timer.is_running());
        assert!(!timer.is_timed_out());

        std::thread::sleep(Duration::from_millis(60));
        assert!(timer.is_timed_out());

        timer.stop();
        assert!(!timer.is_timed_out());
    }
}
