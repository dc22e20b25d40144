use crate::error::{HarnessError, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Message id a validating script sends when every element checked out.
pub const RS_MSG_TEST_PASSED: i32 = 100;
/// Message id a validating script sends on the first mismatch.
pub const RS_MSG_TEST_FAILED: i32 = 101;

/// Out-of-band signal posted by a script once it has checked its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationMessage {
    pub id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Passed,
    Failed,
    Other(i32),
}

impl ValidationMessage {
    pub fn new(id: i32) -> Self {
        Self { id }
    }

    pub fn passed() -> Self {
        Self::new(RS_MSG_TEST_PASSED)
    }

    pub fn failed() -> Self {
        Self::new(RS_MSG_TEST_FAILED)
    }

    pub fn status(&self) -> MessageStatus {
        match self.id {
            RS_MSG_TEST_PASSED => MessageStatus::Passed,
            RS_MSG_TEST_FAILED => MessageStatus::Failed,
            other => MessageStatus::Other(other),
        }
    }
}

#[derive(Debug, Default)]
struct WaitState {
    submitted: u64,
    completed: u64,
    message: Option<ValidationMessage>,
    first_posted: Option<ValidationMessage>,
    failure: Option<HarnessError>,
}

impl WaitState {
    fn poison(&mut self, err: HarnessError) {
        if self.failure.is_none() {
            log::error!("compute context poisoned: {err}");
            self.failure = Some(err);
        } else {
            log::debug!("ignoring follow-up failure: {err}");
        }
    }
}

/// Completion counters and the single message slot of one context.
///
/// The submitting thread bumps `submitted`, the worker bumps `completed`,
/// and both blocking calls sleep on the same condvar.
#[derive(Debug, Default)]
pub struct CompletionWaiter {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl CompletionWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WaitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_submission(&self) -> u64 {
        let mut state = self.lock();
        state.submitted += 1;
        state.submitted
    }

    pub(crate) fn record_completion(&self) {
        let mut state = self.lock();
        state.completed += 1;
        self.cond.notify_all();
    }

    /// Poisons the context. Only the first failure is kept.
    pub(crate) fn record_failure(&self, err: HarnessError) {
        self.lock().poison(err);
        self.cond.notify_all();
    }

    pub fn failure(&self) -> Option<HarnessError> {
        self.lock().failure.clone()
    }

    pub fn pending(&self) -> u64 {
        let state = self.lock();
        state.submitted - state.completed
    }

    /// Fills the message slot. A context carries one message per run: any
    /// later post is dropped and poisons the context, whether or not the
    /// first message has been consumed.
    pub fn post(&self, message: ValidationMessage) {
        let mut state = self.lock();
        match state.first_posted {
            Some(first) => {
                log::warn!("dropping message {} posted after message {}", message.id, first.id);
                state.poison(HarnessError::InvalidArgument(format!(
                    "message {} posted after message {}; one message per run",
                    message.id, first.id
                )));
            }
            None => {
                log::debug!("validation message {} posted", message.id);
                state.first_posted = Some(message);
                state.message = Some(message);
            }
        }
        self.cond.notify_all();
    }

    /// Blocks until every submission made before this call has completed.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        let guard = self.lock();
        let target = guard.submitted;
        let (guard, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| {
                s.completed < target && s.failure.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(err) = &guard.failure {
            return Err(err.clone());
        }
        if result.timed_out() && guard.completed < target {
            return Err(HarnessError::Timeout {
                what: "pending work to finish",
                waited_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Blocks until a message is available, then consumes it.
    pub fn wait_for_message(&self, timeout: Duration) -> Result<ValidationMessage> {
        let guard = self.lock();
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| {
                s.message.is_none() && s.failure.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(message) = guard.message.take() {
            return Ok(message);
        }
        if let Some(err) = &guard.failure {
            return Err(err.clone());
        }
        Err(HarnessError::Timeout {
            what: "a validation message",
            waited_ms: timeout.as_millis() as u64,
        })
    }
}
