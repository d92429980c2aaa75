//! §3 "Container" data model and container-scope state machine.
use crate::error::SandboxError;
use shared::rpc::Process;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ContainerState {
    Ready,
    Running,
    Paused,
    Stopped,
}

impl ContainerState {
    pub fn name(self) -> &'static str {
        match self {
            ContainerState::Ready => "ready",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Stopped => "stopped",
        }
    }

    /// Mirrors the Sandbox container-scope rules (§3): Ready->Running,
    /// Running<->Paused, {Running,Paused}->Stopped, Stopped->Running
    /// (restart).
    pub fn can_transition_to(self, to: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Stopped, Running)
        )
    }
}

/// Root-filesystem descriptor (§3 "Container Attributes").
#[derive(Debug, Clone, Default)]
pub struct RootFs {
    pub path: String,
    pub block_device_id: Option<String>,
    pub fs_type: String,
    /// Extra mount options the backing device requires, e.g. `dax` for an
    /// Nvdimm-driven pmem rootfs (§4.3).
    pub mount_options: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerResources {
    pub cpu_period_us: Option<u64>,
    pub cpu_quota_us: Option<i64>,
    pub cpu_shares: Option<u64>,
    pub memory_limit_bytes: Option<i64>,
    pub hugepage_limits_bytes: Vec<(String, u64)>,
}

/// §3: exclusively owns its Mount list and Process descriptor; devices it
/// references are shared-owned by the Sandbox's Device Manager.
pub struct Container {
    pub id: String,
    pub rootfs: RootFs,
    pub mounts: Vec<Mount>,
    pub device_ids: Vec<String>,
    pub resources: ContainerResources,
    pub cgroup_path: String,
    pub annotations: Vec<(String, String)>,
    pub process: Option<Process>,
    state: ContainerState,
}

impl Container {
    pub fn new(id: impl Into<String>, rootfs: RootFs) -> Self {
        Self {
            id: id.into(),
            rootfs,
            mounts: Vec::new(),
            device_ids: Vec::new(),
            resources: ContainerResources::default(),
            cgroup_path: String::new(),
            annotations: Vec::new(),
            process: None,
            state: ContainerState::Ready,
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn transition(&mut self, to: ContainerState) -> Result<(), SandboxError> {
        if !self.state.can_transition_to(to) {
            return Err(SandboxError::InvalidState {
                current: self.state.name(),
                requested: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_cannot_skip_straight_to_stopped() {
        let mut c = Container::new(
            "c1",
            RootFs {
                path: "/".to_string(),
                block_device_id: None,
                fs_type: "ext4".to_string(),
                mount_options: Vec::new(),
            },
        );
        assert!(c.transition(ContainerState::Stopped).is_err());
        assert!(c.transition(ContainerState::Running).is_ok());
        assert!(c.transition(ContainerState::Stopped).is_ok());
        assert!(c.transition(ContainerState::Running).is_ok());
    }
}
