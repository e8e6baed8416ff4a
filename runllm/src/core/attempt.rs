//! Retry/recovery state machine.
//!
//! ```text
//! RENDER -> INVOKE -> PARSE -> VALIDATE -> SUCCESS
//!                       |         |
//!                       +----+----+
//!                            v
//!                 RETRY -> RENDER (attempt + 1)
//!                   or EXHAUSTED
//! ```
//!
//! The machine only knows about retryable output failures. Fatal errors abort
//! the run from outside without consulting it.

use thiserror::Error;

use crate::core::types::AttemptFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Render,
    Invoke,
    Parse,
    Validate,
    Success,
    Retry,
    Exhausted,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Success | AttemptState::Exhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    Rendered,
    Invoked,
    Parsed,
    Validated,
    Failed(AttemptFailure),
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event {event:?} is not valid in state {state:?}")]
pub struct InvalidTransition {
    pub state: AttemptState,
    pub event: AttemptEvent,
}

#[derive(Debug, Clone)]
pub struct AttemptMachine {
    max_retries: u32,
    attempt: u32,
    state: AttemptState,
    failures: Vec<AttemptFailure>,
}

impl AttemptMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempt: 1,
            state: AttemptState::Render,
            failures: Vec::new(),
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Current 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn retries(&self) -> u32 {
        self.attempt - 1
    }

    /// Recovery text is only appended once a previous attempt has failed.
    pub fn include_recovery(&self) -> bool {
        self.attempt > 1
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.failures.last()
    }

    pub fn failures(&self) -> &[AttemptFailure] {
        &self.failures
    }

    pub fn advance(&mut self, event: AttemptEvent) -> Result<AttemptState, InvalidTransition> {
        let next = match (self.state, &event) {
            (AttemptState::Render, AttemptEvent::Rendered) => AttemptState::Invoke,
            (AttemptState::Invoke, AttemptEvent::Invoked) => AttemptState::Parse,
            (AttemptState::Parse, AttemptEvent::Parsed) => AttemptState::Validate,
            (AttemptState::Validate, AttemptEvent::Validated) => AttemptState::Success,
            (AttemptState::Parse | AttemptState::Validate, AttemptEvent::Failed(failure)) => {
                self.failures.push(failure.clone());
                if self.attempt < self.max_attempts() {
                    AttemptState::Retry
                } else {
                    AttemptState::Exhausted
                }
            }
            (AttemptState::Retry, AttemptEvent::Restart) => {
                self.attempt += 1;
                AttemptState::Render
            }
            (state, _) => return Err(InvalidTransition { state, event }),
        };
        self.state = next;
        Ok(next)
    }
}
