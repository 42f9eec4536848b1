//! Cancellable one-shot debounce timer.
//!
//! The timer holds only a deadline; the owning loop awaits [`Debounce::wait`]
//! inside its `select!`. Built on `tokio::time`, so tests drive it with a
//! paused clock.

use std::time::Duration;
use tokio::time::Instant;

/// Quiet window before a scheduled persistence write fires.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_millis(5000);

#[derive(Debug)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Arm the timer, pushing any pending deadline out to `now + delay`.
    pub fn schedule(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Disarm. Returns whether a deadline was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the armed deadline passes; never resolves while
    /// disarmed. Does not disarm; the caller calls [`Debounce::cancel`] when
    /// it acts on the firing.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}
