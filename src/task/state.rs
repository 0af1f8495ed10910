//! Task Handle state machine (spec §4.8).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Exited,
    Destroyed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Exited => "exited",
            TaskState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

impl TaskState {
    /// `StopTask` is valid in `Running` (normal case) and `Exited` (no-op).
    pub fn stop_is_valid(self) -> bool {
        matches!(self, TaskState::Running | TaskState::Exited)
    }

    /// `WaitTask` is valid in any state; callers in `Exited`/`Destroyed`
    /// receive the cached result.
    pub fn wait_returns_cached(self) -> bool {
        matches!(self, TaskState::Exited | TaskState::Destroyed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExitResult {
    pub exit_code: i64,
    pub signal: i32,
    pub oom_killed: bool,
    pub err: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_valid_in_running_and_exited_only() {
        assert!(TaskState::Running.stop_is_valid());
        assert!(TaskState::Exited.stop_is_valid());
        assert!(!TaskState::Created.stop_is_valid());
        assert!(!TaskState::Destroyed.stop_is_valid());
    }

    #[test]
    fn wait_cached_only_after_exit() {
        assert!(!TaskState::Created.wait_returns_cached());
        assert!(!TaskState::Running.wait_returns_cached());
        assert!(TaskState::Exited.wait_returns_cached());
        assert!(TaskState::Destroyed.wait_returns_cached());
    }
}
