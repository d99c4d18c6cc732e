//! Bounded waiting.
//!
//! Every loop that waits on the target is built from a [`Deadline`] (hard
//! ceiling) and, where output has to stabilise, a [`Quiet`] window. Both read
//! the tokio clock so paused-time tests drive them deterministically.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            at: start + limit,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Shortens `step` so a single poll never overshoots the deadline.
    pub fn clamp(&self, step: Duration) -> Duration {
        step.min(self.remaining())
    }

    pub async fn pause(&self, step: Duration) {
        let step = self.clamp(step);
        if !step.is_zero() {
            tokio::time::sleep(step).await;
        }
    }
}

/// Tracks how long the stream has been silent.
#[derive(Debug, Clone, Copy)]
pub struct Quiet {
    window: Duration,
    last_activity: Instant,
}

impl Quiet {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn settled(&self) -> bool {
        self.last_activity.elapsed() >= self.window
    }

    /// Time left before the window would close with no further activity.
    pub fn remaining(&self) -> Duration {
        self.window.saturating_sub(self.last_activity.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_after_limit() {
        let deadline = Deadline::after(Duration::from_secs(2));
        assert!(!deadline.expired());
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(!deadline.expired());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_never_overshoots() {
        let deadline = Deadline::after(Duration::from_millis(120));
        deadline.pause(Duration::from_millis(100)).await;
        deadline.pause(Duration::from_millis(100)).await;
        assert_eq!(deadline.elapsed(), Duration::from_millis(120));
        assert!(deadline.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_resets_on_activity() {
        let mut quiet = Quiet::new(Duration::from_millis(300));
        tokio::time::sleep(Duration::from_millis(200)).await;
        quiet.touch();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!quiet.settled());
        assert_eq!(quiet.remaining(), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(quiet.settled());
    }
}
