//! Shared plug-in call outcome.
//!
//! The engine never uses exceptions-as-control-flow for state-machine
//! steps: every plug-in call that drives a transition returns this small
//! result enum instead of raising and being caught generically.

/// Outcome of a provider or OS-manager plug-in operation that may still be
/// in flight (`deploy_for_user`, `check_state`, `cancel`, `destroy`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// The operation completed successfully.
    Finished,
    /// The operation is still running; poll again next tick.
    Running,
    /// The operation failed. Carries the reason for `error_reason()`.
    Error(String),
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Finished)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    pub fn error_reason(&self) -> Option<&str> {
        match self {
            TaskState::Error(reason) => Some(reason.as_str()),
            _ => None,
        }
    }
}
