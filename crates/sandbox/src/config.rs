//! §3/§6 `SandboxConfig`: what `SandboxEngine::create` validates in step 1.
use crate::error::SandboxError;
use hypervisor::HypervisorConfig;
use resource::{BridgingStrategy, EndpointKind};
use std::path::PathBuf;

/// §4.4: a network endpoint to cold-attach before the VM starts.
#[derive(Debug, Clone)]
pub struct NetworkEndpointSpec {
    pub name: String,
    pub hardware_addr: String,
    pub kind: EndpointKind,
    pub bridging: BridgingStrategy,
}

/// How a VFIO device request attached to a container should be wired.
/// §8 S6: `GuestKernel` devices are handled entirely by the guest kernel's
/// own driver and must not be registered with the Device Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfioMode {
    Normal,
    GuestKernel,
}

#[derive(Debug, Clone)]
pub struct VfioDeviceRequest {
    pub bdf: String,
    pub iommu_group: u32,
    pub mode: VfioMode,
}

/// §4.3 "Pmem block devices use a dedicated driver and expose a `dax`
/// mount option." Present only when the rootfs is backed by a pmem device.
#[derive(Debug, Clone, Copy)]
pub struct PmemRootfs {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub id: String,
    pub rootfs_path: String,
    pub fs_type: String,
    pub command: Vec<String>,
    pub devices: Vec<VfioDeviceRequest>,
    pub pmem_rootfs: Option<PmemRootfs>,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub id: String,
    pub hostname: String,
    pub run_store: PathBuf,
    pub hypervisor_config: HypervisorConfig,
    pub containers: Vec<ContainerSpec>,
    pub network_endpoints: Vec<NetworkEndpointSpec>,
    pub boot_from_template: bool,
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.id.is_empty() {
            return Err(SandboxError::InvalidConfig("sandbox id must be set".to_string()));
        }
        let mut ids = std::collections::HashSet::new();
        for c in &self.containers {
            if c.id.is_empty() {
                return Err(SandboxError::InvalidConfig(
                    "container id must be set".to_string(),
                ));
            }
            if !ids.insert(c.id.clone()) {
                return Err(SandboxError::InvalidConfig(format!(
                    "duplicate container id: {}",
                    c.id
                )));
            }
        }
        Ok(())
    }
}
