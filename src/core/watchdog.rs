//! Sliding response watchdog
//!
//! Every long-running instrument operation holds exactly one watchdog. Each
//! inbound data chunk disarms and re-arms it, so the clock measures silence
//! on the wire, not total operation time. Drivers `select!` between their
//! event inbox and [`ResponseWatchdog::expired`], and disarm before any
//! terminal transition so an expiry can never fire after completion.

use std::time::Duration;

use tokio::time::Instant;

/// Default silence window before an operation is declared timed out.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// One-shot, re-armable deadline.
#[derive(Debug)]
pub struct ResponseWatchdog {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl ResponseWatchdog {
    /// Create a disarmed watchdog with the given silence window.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Arm (or re-arm) the deadline at `now + timeout`.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    /// Drop the deadline. Safe to call when not armed.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is currently pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; never resolves while
    /// disarmed. Recreate the future after every `arm`/`disarm` (the
    /// operation drivers do this naturally by polling inside a loop).
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

impl Default for ResponseWatchdog {
    fn default() -> Self {
        Self::new(RESPONSE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_window() {
        let mut watchdog = ResponseWatchdog::new(Duration::from_millis(100));
        watchdog.arm();

        let before = Instant::now();
        watchdog.expired().await;
        assert!(Instant::now() - before >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_slides_deadline() {
        let mut watchdog = ResponseWatchdog::new(Duration::from_millis(100));
        watchdog.arm();

        tokio::time::advance(Duration::from_millis(60)).await;
        watchdog.disarm();
        watchdog.arm();

        let before = Instant::now();
        watchdog.expired().await;
        // The full window again, not the 40ms left of the first one.
        assert!(Instant::now() - before >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_is_idempotent() {
        let mut watchdog = ResponseWatchdog::default();
        watchdog.arm();
        watchdog.disarm();
        watchdog.disarm();
        assert!(!watchdog.is_armed());

        // A disarmed watchdog never fires.
        let expiry = tokio::time::timeout(Duration::from_secs(5), watchdog.expired()).await;
        assert!(expiry.is_err());
    }
}
