//! §3 "Sandbox" state machine.
use crate::error::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SandboxState {
    Creating,
    Ready,
    Running,
    Paused,
    Stopped,
}

impl SandboxState {
    pub fn name(self) -> &'static str {
        match self {
            SandboxState::Creating => "creating",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Stopped => "stopped",
        }
    }

    /// Creating->Ready->Running<->Paused; Running->Stopped; Paused->Stopped;
    /// Stopped->Running (restart).
    pub fn can_transition_to(self, to: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, to),
            (Creating, Ready)
                | (Ready, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Stopped, Running)
        )
    }
}

/// Enforces the transition table and produces a typed error on violation,
/// rather than letting callers inline a `matches!` at every call site.
pub fn transition(current: &mut SandboxState, to: SandboxState) -> Result<(), SandboxError> {
    if !current.can_transition_to(to) {
        return Err(SandboxError::InvalidState {
            current: current.name(),
            requested: to.name(),
        });
    }
    *current = to;
    Ok(())
}
