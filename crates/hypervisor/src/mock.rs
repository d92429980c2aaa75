//! In-memory `Hypervisor` used by the sandbox tests and scenarios S1-S3.
use crate::capabilities::Capabilities;
use crate::config::HypervisorConfig;
use crate::device_manager::{Device, DeviceManager};
use crate::error::HypervisorError;
use crate::{DeviceHandle, MemoryDevice, VmState};
use async_trait::async_trait;
use std::sync::Mutex;

struct Inner {
    state: VmState,
    config: Option<HypervisorConfig>,
    memory_mb: u32,
    vcpus: u32,
    devices: DeviceManager,
    fail_create: bool,
}

/// Mock hypervisor backend selected via the factory's construction-time
/// variant (§9 "Mock variant selected at construction time through a
/// factory, not behind a runtime feature flag").
pub struct MockHypervisor {
    inner: Mutex<Inner>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: VmState::Uninitialized,
                config: None,
                memory_mb: 0,
                vcpus: 0,
                devices: DeviceManager::new(),
                fail_create: false,
            }),
        }
    }

    /// Test hook: make the next `create_vm` call fail, simulating a missing
    /// hypervisor binary (§8 "rollback on missing hypervisor binary").
    pub fn fail_next_create(&self) {
        self.inner.lock().unwrap().fail_create = true;
    }

    fn require_state(&self, inner: &Inner, allowed: &[VmState]) -> Result<(), HypervisorError> {
        if allowed.contains(&inner.state) {
            Ok(())
        } else {
            Err(HypervisorError::InvalidState {
                current: state_name(inner.state),
                requested: "transition",
            })
        }
    }
}

fn state_name(state: VmState) -> &'static str {
    match state {
        VmState::Uninitialized => "uninitialized",
        VmState::Created => "created",
        VmState::Running => "running",
        VmState::Paused => "paused",
        VmState::Stopped => "stopped",
    }
}

#[async_trait]
impl crate::Hypervisor for MockHypervisor {
    async fn create_vm(&self, _id: &str, mut config: HypervisorConfig) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Uninitialized])?;
        if inner.fail_create {
            inner.fail_create = false;
            return Err(HypervisorError::InvalidConfig(
                "hypervisor binary not found".to_string(),
            ));
        }
        config.validate()?;
        inner.vcpus = config.num_vcpus.ceil() as u32;
        inner.memory_mb = config.memory_mib;
        inner.config = Some(config);
        inner.state = VmState::Created;
        Ok(())
    }

    async fn start_vm(&self, _timeout_secs: u64) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Created])?;
        inner.state = VmState::Running;
        Ok(())
    }

    async fn stop_vm(&self, _wait_only: bool) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.state = VmState::Stopped;
        Ok(())
    }

    async fn pause_vm(&self) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Running])?;
        inner.state = VmState::Paused;
        Ok(())
    }

    async fn resume_vm(&self) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Paused])?;
        inner.state = VmState::Running;
        Ok(())
    }

    async fn save_vm(&self) -> Result<(), HypervisorError> {
        let inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Paused, VmState::Running])?;
        Ok(())
    }

    async fn add_device(&self, device: Device) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Created])?;
        let id = inner.devices.register(device);
        inner.devices.attach(&id)?;
        Ok(())
    }

    async fn hotplug_add_device(&self, device: Device) -> Result<DeviceHandle, HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Running])?;
        let id = inner.devices.register(device);
        inner.devices.attach(&id)?;
        Ok(DeviceHandle(id))
    }

    async fn hotplug_remove_device(&self, handle: DeviceHandle) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Running, VmState::Paused])?;
        inner
            .devices
            .detach(&handle.0)
            .map_err(HypervisorError::from)?;
        Ok(())
    }

    async fn resize_vcpus(&self, new_count: u32) -> Result<(u32, u32), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Running])?;
        let old = inner.vcpus;
        inner.vcpus = new_count;
        Ok((old, new_count))
    }

    async fn resize_memory(
        &self,
        req_mb: u32,
        block_mb: u32,
        probe: bool,
    ) -> Result<(u32, MemoryDevice), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        let default_mb = inner.config.as_ref().map(|c| c.memory_mib).unwrap_or(0);
        let overhead_mb = inner
            .config
            .as_ref()
            .map(|c| c.memory_overhead_mib)
            .unwrap_or(0);
        let current = inner.memory_mb;
        let (new_total, delta, remaining_overhead, performed) =
            crate::compute_memory_resize(current, req_mb, block_mb, default_mb, overhead_mb);
        if let Some(cfg) = inner.config.as_mut() {
            cfg.memory_overhead_mib = remaining_overhead;
        }
        if performed {
            inner.memory_mb = new_total;
        }
        Ok((
            new_total,
            MemoryDevice {
                addr: 0,
                size_mb: delta,
                probed: probe,
            },
        ))
    }

    async fn get_total_memory_mb(&self) -> u32 {
        self.inner.lock().unwrap().memory_mb
    }

    async fn get_thread_ids(&self) -> Result<Vec<u32>, HypervisorError> {
        Ok(vec![1])
    }

    async fn get_pids(&self) -> Result<Vec<u32>, HypervisorError> {
        Ok(vec![1])
    }

    async fn get_vm_console(&self) -> Result<(String, String), HypervisorError> {
        Ok(("mock".to_string(), "/dev/null".to_string()))
    }

    async fn check(&self) -> Result<(), HypervisorError> {
        let inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Created, VmState::Running, VmState::Paused])
    }

    fn generate_socket(&self, id: &str) -> String {
        format!("/tmp/mock-{id}.sock")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn save(&self) -> Result<Vec<u8>, HypervisorError> {
        let inner = self.inner.lock().unwrap();
        serde_json::to_vec(&(inner.memory_mb, inner.vcpus, inner.state))
            .map_err(|e| HypervisorError::Vmm(e.to_string()))
    }

    async fn load(&self, state: &[u8]) -> Result<(), HypervisorError> {
        let (memory_mb, vcpus, vm_state): (u32, u32, VmState) =
            serde_json::from_slice(state).map_err(|e| HypervisorError::Vmm(e.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        inner.memory_mb = memory_mb;
        inner.vcpus = vcpus;
        inner.state = vm_state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hypervisor;

    fn config() -> HypervisorConfig {
        HypervisorConfig {
            hypervisor_path: "/bin/true".to_string(),
            kernel_path: "/boot/vmlinux".to_string(),
            image_path: Some("/var/lib/rootfs.img".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_lifecycle_matches_state_machine() {
        let hv = MockHypervisor::new();
        hv.create_vm("sb1", config()).await.unwrap();
        hv.start_vm(5).await.unwrap();
        hv.pause_vm().await.unwrap();
        hv.resume_vm().await.unwrap();
        hv.stop_vm(false).await.unwrap();
    }

    #[tokio::test]
    async fn create_vm_can_be_forced_to_fail_for_rollback_tests() {
        let hv = MockHypervisor::new();
        hv.fail_next_create();
        assert!(hv.create_vm("sb1", config()).await.is_err());
        // state remains Uninitialized so a retry can proceed
        hv.create_vm("sb1", config()).await.unwrap();
    }

    #[tokio::test]
    async fn resize_memory_uses_shared_compensation_formula() {
        let hv = MockHypervisor::new();
        let mut cfg = config();
        cfg.memory_mib = 512;
        cfg.memory_overhead_mib = 256;
        hv.create_vm("sb1", cfg).await.unwrap();
        hv.start_vm(5).await.unwrap();
        let (total, device) = hv.resize_memory(1024, 1, false).await.unwrap();
        assert_eq!(total, 768);
        assert_eq!(device.size_mb, 256);
    }

    #[tokio::test]
    async fn hotplug_device_roundtrip() {
        let hv = MockHypervisor::new();
        hv.create_vm("sb1", config()).await.unwrap();
        hv.start_vm(5).await.unwrap();
        let handle = hv
            .hotplug_add_device(Device::NetworkEndpoint {
                name: "eth0".to_string(),
                mac: None,
                rx_rate_limiter: None,
                tx_rate_limiter: None,
            })
            .await
            .unwrap();
        hv.hotplug_remove_device(handle).await.unwrap();
    }
}
