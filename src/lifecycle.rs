use crate::error::{HarnessError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Active,
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Uninitialized => f.write_str("uninitialized"),
            LifecycleState::Active => f.write_str("active"),
            LifecycleState::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// `Uninitialized -> Active -> Destroyed`, with no way back.
#[derive(Debug)]
pub struct ContextLifecycle {
    state: LifecycleState,
}

impl Default for ContextLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextLifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn activate(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Uninitialized => {
                self.state = LifecycleState::Active;
                Ok(())
            }
            other => Err(HarnessError::Lifecycle(format!(
                "cannot create a context that is already {other}"
            ))),
        }
    }

    pub fn destroy(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Active => {
                self.state = LifecycleState::Destroyed;
                Ok(())
            }
            LifecycleState::Destroyed => Err(HarnessError::Lifecycle(
                "context destroyed twice".to_string(),
            )),
            LifecycleState::Uninitialized => Err(HarnessError::Lifecycle(
                "cannot destroy a context that was never created".to_string(),
            )),
        }
    }

    /// Fails unless the context can still accept work.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(HarnessError::Lifecycle(format!(
                "context is {}",
                self.state
            )))
        }
    }
}
