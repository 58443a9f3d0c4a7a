use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// States of one hosted runtime, owned by its `RuntimeProcessHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    NotStarted,
    /// Loading native libraries and resolving the entry point.
    Starting,
    Running,
    Crashed,
    Exited,
}

impl RuntimeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RuntimeState::Crashed | RuntimeState::Exited)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeState::NotStarted => write!(f, "not-started"),
            RuntimeState::Starting => write!(f, "starting"),
            RuntimeState::Running => write!(f, "running"),
            RuntimeState::Crashed => write!(f, "crashed"),
            RuntimeState::Exited => write!(f, "exited"),
        }
    }
}

pub fn validate_transition(from: RuntimeState, to: RuntimeState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (RuntimeState::NotStarted, RuntimeState::Starting)
            | (
                RuntimeState::Starting,
                RuntimeState::Running | RuntimeState::Crashed
            )
            | (
                RuntimeState::Running,
                RuntimeState::Crashed | RuntimeState::Exited
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
