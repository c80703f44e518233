use std::fmt;

/// Lifecycle of a [`WorkerRuntime`](crate::WorkerRuntime).
///
/// `Idle -> Running`, then `Running -> Draining -> Reloading -> Running` for a
/// reload, or `Running -> Draining -> Stopped` for a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeState {
    Idle,
    Running,
    Draining,
    Reloading,
    Stopped,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Idle => "idle",
            RuntimeState::Running => "running",
            RuntimeState::Draining => "draining",
            RuntimeState::Reloading => "reloading",
            RuntimeState::Stopped => "stopped",
        }
    }

    /// Only a running runtime claims new jobs.
    pub fn is_claiming(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }

    pub fn can_transition_to(&self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Stopped)
                | (Running, Draining)
                | (Draining, Reloading)
                | (Draining, Stopped)
                | (Reloading, Running)
                | (Reloading, Stopped)
        )
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_cycle_is_allowed() {
        let cycle = [
            RuntimeState::Idle,
            RuntimeState::Running,
            RuntimeState::Draining,
            RuntimeState::Reloading,
            RuntimeState::Running,
            RuntimeState::Draining,
            RuntimeState::Stopped,
        ];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn stopped_is_final() {
        for next in [
            RuntimeState::Idle,
            RuntimeState::Running,
            RuntimeState::Draining,
            RuntimeState::Reloading,
        ] {
            assert!(!RuntimeState::Stopped.can_transition_to(next));
        }
        assert!(!RuntimeState::Running.can_transition_to(RuntimeState::Reloading));
    }

    #[test]
    fn only_running_claims() {
        assert!(RuntimeState::Running.is_claiming());
        for state in [
            RuntimeState::Idle,
            RuntimeState::Draining,
            RuntimeState::Reloading,
            RuntimeState::Stopped,
        ] {
            assert!(!state.is_claiming(), "{state}");
        }
    }
}
