//! §3 `HypervisorConfig` data model plus §6 shared-fs / block-driver /
//! confidential-guest configuration knobs.
use crate::error::HypervisorError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SharedFsKind {
    #[default]
    None,
    VirtioFs,
    VirtioFsNydus,
    NinePe,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BlockDeviceDriver {
    #[default]
    VirtioBlk,
    VirtioBlkCcw,
    VirtioScsi,
    VirtioMmio,
    Nvdimm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VfioPortKind {
    #[default]
    Bridge,
    Root,
}

/// Default total vCPUs and memory when the caller leaves them unset.
pub const DEFAULT_VCPUS: f64 = 1.0;
pub const DEFAULT_MEMORY_MIB: u32 = 128;
pub const DEFAULT_MEMORY_SLOTS: u32 = 10;
pub const DEFAULT_MAX_VCPUS: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub hypervisor_path: String,
    pub kernel_path: String,
    pub image_path: Option<String>,
    pub initrd_path: Option<String>,
    pub num_vcpus: f64,
    pub memory_mib: u32,
    pub memory_slots: u32,
    pub default_bridges: u32,
    pub default_max_vcpus: u32,
    pub block_device_driver: BlockDeviceDriver,
    pub shared_fs: SharedFsKind,
    pub confidential_guest: bool,
    pub vfio_port: VfioPortKind,
    pub memory_overhead_mib: u32,
    pub boot_to_template: bool,
    pub boot_from_template_path: Option<String>,
    pub long_live_conn: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            hypervisor_path: String::new(),
            kernel_path: String::new(),
            image_path: None,
            initrd_path: None,
            num_vcpus: DEFAULT_VCPUS,
            memory_mib: DEFAULT_MEMORY_MIB,
            memory_slots: DEFAULT_MEMORY_SLOTS,
            default_bridges: 1,
            default_max_vcpus: DEFAULT_MAX_VCPUS,
            block_device_driver: BlockDeviceDriver::default(),
            shared_fs: SharedFsKind::default(),
            confidential_guest: false,
            vfio_port: VfioPortKind::default(),
            memory_overhead_mib: 0,
            boot_to_template: false,
            boot_from_template_path: None,
            long_live_conn: false,
        }
    }
}

impl HypervisorConfig {
    /// Applies documented defaults to unset numeric fields and validates
    /// the invariants in §3: exactly one of image/initrd unless a
    /// confidential-guest machine type requires neither.
    pub fn validate(&mut self) -> Result<(), HypervisorError> {
        if self.num_vcpus <= 0.0 {
            self.num_vcpus = DEFAULT_VCPUS;
        }
        if self.memory_mib == 0 {
            self.memory_mib = DEFAULT_MEMORY_MIB;
        }
        if self.memory_slots == 0 {
            self.memory_slots = DEFAULT_MEMORY_SLOTS;
        }
        if self.default_max_vcpus == 0 {
            self.default_max_vcpus = DEFAULT_MAX_VCPUS;
        }

        if self.hypervisor_path.is_empty() {
            return Err(HypervisorError::InvalidConfig(
                "hypervisor_path must be set".to_string(),
            ));
        }

        let has_image = self.image_path.is_some();
        let has_initrd = self.initrd_path.is_some();
        if has_image && has_initrd {
            return Err(HypervisorError::InvalidConfig(
                "exactly one of image_path/initrd_path may be set".to_string(),
            ));
        }
        if !has_image && !has_initrd && !self.confidential_guest {
            return Err(HypervisorError::InvalidConfig(
                "one of image_path/initrd_path is required unless confidential_guest".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_both_image_and_initrd() {
        let mut cfg = HypervisorConfig {
            hypervisor_path: "/bin/true".to_string(),
            image_path: Some("a".to_string()),
            initrd_path: Some("b".to_string()),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fills_in_documented_defaults() {
        let mut cfg = HypervisorConfig {
            hypervisor_path: "/bin/true".to_string(),
            image_path: Some("a".to_string()),
            num_vcpus: 0.0,
            memory_mib: 0,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.num_vcpus, DEFAULT_VCPUS);
        assert_eq!(cfg.memory_mib, DEFAULT_MEMORY_MIB);
    }

    #[test]
    fn confidential_guest_allows_neither_image_nor_initrd() {
        let mut cfg = HypervisorConfig {
            hypervisor_path: "/bin/true".to_string(),
            confidential_guest: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
