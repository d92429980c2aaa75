//! §4.2 Hypervisor Backends (B), plus the Device Manager (§4.3/C) and
//! Bridge/Bus allocator (§4.3/E) that live alongside it, mirroring the real
//! kata-containers layout where `hypervisor::device::device_manager` lives
//! inside the hypervisor crate.
pub mod bridge;
pub mod capabilities;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod firecracker;
pub mod mock;
pub mod remote;

pub use capabilities::Capabilities;
pub use config::HypervisorConfig;
pub use error::HypervisorError;

use async_trait::async_trait;
use device_manager::Device;

/// §4.2 "State machine per VM".
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VmState {
    Uninitialized,
    Created,
    Running,
    Paused,
    Stopped,
}

impl VmState {
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Uninitialized, Created)
                | (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Created, Stopped)
        )
    }
}

/// Result of `resize_memory` (§4.2 numeric semantics): the new total size
/// and the hotplug device description applied (if any).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDevice {
    pub addr: u64,
    pub size_mb: u32,
    pub probed: bool,
}

/// A handle returned by `hotplug_add_device`, opaque to the caller and
/// passed back unchanged to `hotplug_remove_device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle(pub String);

/// §4.2: "compute `delta = req - current`... round up to a multiple of
/// `block`... subtract `default_memory - overhead` from delta... clear the
/// overhead after compensation. If the resulting delta is 0 but
/// compensation applied, still perform a zero-size add for idempotence."
///
/// Returns `(new_total_mb, applied_delta_mb, remaining_overhead_mb,
/// hotplug_performed)`. When the compensated delta goes negative the
/// overhead budget has not yet been paid down: no hotplug happens and the
/// shortfall accumulates onto `overhead_mb` for the next call.
pub fn compute_memory_resize(
    current_mb: u32,
    requested_mb: u32,
    block_mb: u32,
    default_memory_mb: u32,
    overhead_mb: u32,
) -> (u32, u32, u32, bool) {
    let raw_delta = requested_mb as i64 - current_mb as i64;
    if raw_delta <= 0 {
        return (current_mb, 0, overhead_mb, false);
    }

    let block = block_mb.max(1) as i64;
    let delta_rounded = raw_delta.div_ceil(block) * block;

    if overhead_mb > 0 && (overhead_mb as i64) <= default_memory_mb as i64 {
        let compensation = default_memory_mb as i64 - overhead_mb as i64;
        let adjusted = delta_rounded - compensation;
        if adjusted >= 0 {
            let delta = adjusted as u32;
            (current_mb + delta, delta, 0, true)
        } else {
            let new_overhead = overhead_mb + delta_rounded as u32;
            (current_mb, 0, new_overhead, false)
        }
    } else {
        let delta = delta_rounded as u32;
        (current_mb + delta, delta, overhead_mb, true)
    }
}

/// The polymorphic VM backend (§4.2). Implementations must be safe to hold
/// behind `Arc<dyn Hypervisor>` (matching the real kata-containers pattern)
/// and to call concurrently; each call carries its own deadline via the
/// caller's async cancellation (tokio::time::timeout at the call site).
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn create_vm(&self, id: &str, config: HypervisorConfig) -> Result<(), HypervisorError>;
    async fn start_vm(&self, timeout_secs: u64) -> Result<(), HypervisorError>;
    async fn stop_vm(&self, wait_only: bool) -> Result<(), HypervisorError>;
    async fn pause_vm(&self) -> Result<(), HypervisorError>;
    async fn resume_vm(&self) -> Result<(), HypervisorError>;
    async fn save_vm(&self) -> Result<(), HypervisorError>;

    async fn add_device(&self, device: Device) -> Result<(), HypervisorError>;
    async fn hotplug_add_device(&self, device: Device) -> Result<DeviceHandle, HypervisorError>;
    async fn hotplug_remove_device(&self, handle: DeviceHandle) -> Result<(), HypervisorError>;

    async fn resize_vcpus(&self, new_count: u32) -> Result<(u32, u32), HypervisorError>;
    async fn resize_memory(
        &self,
        req_mb: u32,
        block_mb: u32,
        probe: bool,
    ) -> Result<(u32, MemoryDevice), HypervisorError>;

    async fn get_total_memory_mb(&self) -> u32;
    async fn get_thread_ids(&self) -> Result<Vec<u32>, HypervisorError>;
    async fn get_pids(&self) -> Result<Vec<u32>, HypervisorError>;
    async fn get_vm_console(&self) -> Result<(String, String), HypervisorError>;
    async fn check(&self) -> Result<(), HypervisorError>;
    fn generate_socket(&self, id: &str) -> String;
    fn capabilities(&self) -> Capabilities;

    async fn save(&self) -> Result<Vec<u8>, HypervisorError>;
    async fn load(&self, state: &[u8]) -> Result<(), HypervisorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_machine_rejects_illegal_transitions() {
        assert!(VmState::Uninitialized.can_transition_to(VmState::Created));
        assert!(VmState::Created.can_transition_to(VmState::Running));
        assert!(VmState::Running.can_transition_to(VmState::Paused));
        assert!(VmState::Paused.can_transition_to(VmState::Running));
        assert!(!VmState::Uninitialized.can_transition_to(VmState::Running));
        assert!(!VmState::Stopped.can_transition_to(VmState::Running));
    }

    #[test]
    fn memory_overhead_compensation_s4_case_one() {
        // memory_size=512, overhead=256, current=512, requested=1024 -> delta=256, overhead cleared
        let (new_mb, delta, overhead, performed) = compute_memory_resize(512, 1024, 1, 512, 256);
        assert_eq!(delta, 256);
        assert_eq!(new_mb, 768);
        assert_eq!(overhead, 0);
        assert!(performed);
    }

    #[test]
    fn memory_overhead_compensation_s4_case_two() {
        // overhead=256, current=512, requested=600 -> delta=0, overhead grows to 344, hotplug skipped
        let (new_mb, delta, overhead, performed) = compute_memory_resize(512, 600, 1, 512, 256);
        assert_eq!(delta, 0);
        assert_eq!(new_mb, 512);
        assert_eq!(overhead, 344);
        assert!(!performed);
    }

    #[test]
    fn resize_memory_rounds_up_to_block_and_never_shrinks() {
        let (new_mb, delta, _, performed) = compute_memory_resize(512, 600, 128, 0, 0);
        assert!(new_mb >= 512);
        assert_eq!(delta % 128, 0);
        assert!(performed);

        let (new_mb, delta, _, performed) = compute_memory_resize(512, 400, 128, 0, 0);
        assert_eq!(new_mb, 512);
        assert_eq!(delta, 0);
        assert!(!performed);
    }
}
