//! Write-once result cell shared between a producer and any number of waiters.
//!
//! One `Completion` exists per in-flight call, backend job, or session being
//! created. It is reached exactly once; later `complete`/`fail` calls are
//! ignored. Waiters that give up (timeouts, interrupts) never consume the
//! value, so whoever asks next still sees the real outcome.

use crate::error::CallError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

pub type Outcome<T> = Result<T, CallError>;

#[derive(Debug)]
pub struct Completion<T> {
    state: Mutex<Option<Outcome<T>>>,
    reached: Notify,
    interrupted: Notify,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            reached: Notify::new(),
            interrupted: Notify::new(),
        }
    }

    /// Store the outcome if none is stored yet. Returns whether this call won.
    pub fn reach(&self, outcome: Outcome<T>) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
        }
        self.reached.notify_waiters();
        true
    }

    pub fn complete(&self, value: T) -> bool {
        self.reach(Ok(value))
    }

    pub fn fail(&self, error: CallError) -> bool {
        self.reach(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Non-blocking look at the outcome.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.state.lock().clone()
    }

    /// Wait until the outcome is reached.
    pub async fn get(&self) -> Outcome<T> {
        loop {
            let notified = self.reached.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait until the outcome is reached or [`interrupt`](Self::interrupt) is
    /// called. `None` means interrupted.
    pub async fn interruptible_wait(&self) -> Option<Outcome<T>> {
        loop {
            let reached = self.reached.notified();
            let interrupted = self.interrupted.notified();
            tokio::pin!(reached, interrupted);
            reached.as_mut().enable();
            interrupted.as_mut().enable();
            if let Some(outcome) = self.peek() {
                return Some(outcome);
            }
            tokio::select! {
                _ = &mut reached => continue,
                _ = &mut interrupted => return self.peek(),
            }
        }
    }

    /// Wake every current `interruptible_wait` without reaching the cell.
    pub fn interrupt(&self) {
        self.interrupted.notify_waiters();
    }

    /// Race the outcome against a timer. `None` means the bound elapsed; the
    /// cell itself is left untouched for later waiters.
    pub async fn await_or_timeout(&self, bound: Duration) -> Option<Outcome<T>> {
        tokio::select! {
            outcome = self.interruptible_wait() => outcome,
            _ = tokio::time::sleep(bound) => self.peek(),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
