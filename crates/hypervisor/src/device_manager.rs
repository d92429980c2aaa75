//! §4.3 Device Manager (C): the single authoritative registry of devices
//! attached to a sandbox's VM, grounded on the `Arc<RwLock<DeviceManager>>`
//! composition seen in `other_examples/09dc8c96_..._manager_inner.rs.rs`.
use crate::bridge::{BridgeAllocator, BridgeKind};
use crate::error::DeviceError;
use firecracker_sdk::dto::RateLimiter;
use std::collections::HashMap;

pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDriver {
    VirtioBlk,
    VirtioBlkCcw,
    VirtioScsi,
    VirtioMmio,
    Nvdimm,
    VhostUserBlk,
}

/// §3 Device variants. `vm_addr` is filled in once the device is attached
/// to a bridge (0→1 transition); it is `None` while only reference-counted
/// but not yet wired into the VM.
#[derive(Debug, Clone)]
pub enum Device {
    Block {
        path: String,
        driver: BlockDriver,
        major: u32,
        minor: u32,
    },
    VhostUserNet {
        socket_path: String,
        mac: Option<String>,
    },
    VhostUserBlk {
        socket_path: String,
    },
    VhostUserScsi {
        socket_path: String,
    },
    VhostUserFs {
        socket_path: String,
    },
    Vfio {
        bdf: String,
        vendor: Option<String>,
        device: Option<String>,
        iommu_group: u32,
    },
    GenericChar {
        path: String,
    },
    NetworkEndpoint {
        name: String,
        mac: Option<String>,
        rx_rate_limiter: Option<RateLimiter>,
        tx_rate_limiter: Option<RateLimiter>,
    },
    Memory {
        slot: u32,
        size_mb: u32,
        addr: u64,
        probe: bool,
    },
}

impl Device {
    fn bridge_kind(&self) -> BridgeKind {
        match self {
            Device::Block {
                driver: BlockDriver::VirtioBlkCcw,
                ..
            } => BridgeKind::Ccw,
            _ => BridgeKind::Pci,
        }
    }

    /// Host-path dedup key used for coalescing (§4.3 "two containers
    /// referencing the same host device share one attach").
    fn dedup_key(&self) -> Option<(u32, u32)> {
        match self {
            Device::Block { major, minor, .. } => Some((*major, *minor)),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub device: Device,
    pub attach_count: u32,
    pub bridge_slot: Option<(u32, u32)>,
}

/// Host path stat info used to select a concrete driver variant for a new
/// block/char device (§4.3 `new_device`).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub host_path: String,
    pub major: u32,
    pub minor: u32,
    pub requested_driver: BlockDriver,
    pub vhost_user_blk_major: Option<u32>,
    pub is_pmem: bool,
    pub hugepages_enabled: bool,
}

#[derive(Default)]
pub struct DeviceManager {
    devices: HashMap<DeviceId, DeviceRecord>,
    by_dedup_key: HashMap<(u32, u32), DeviceId>,
    bridges: BridgeAllocator,
    next_id: u64,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_device_id(&mut self) -> DeviceId {
        self.next_id += 1;
        format!("dev-{}", self.next_id)
    }

    /// §4.3 `new_device`: resolve the concrete driver variant from host
    /// path stat info, coalescing on `(major, minor)` when a matching
    /// device is already tracked.
    pub fn new_device(&mut self, info: DeviceInfo) -> Result<DeviceId, DeviceError> {
        if info.host_path.is_empty() {
            return Err(DeviceError::MissingHostPath(info.host_path));
        }

        if let Some(existing) = self.find_device(info.major, info.minor) {
            return Ok(existing);
        }

        let driver = if let Some(vhost_major) = info.vhost_user_blk_major {
            if info.major == vhost_major {
                if !info.hugepages_enabled {
                    return Err(DeviceError::DriverMismatch(
                        "vhost-user-blk requires hugepages".to_string(),
                    ));
                }
                BlockDriver::VhostUserBlk
            } else {
                info.requested_driver
            }
        } else {
            info.requested_driver
        };

        let device = Device::Block {
            path: info.host_path,
            driver: if info.is_pmem {
                BlockDriver::Nvdimm
            } else {
                driver
            },
            major: info.major,
            minor: info.minor,
        };

        Ok(self.register(device))
    }

    /// Registers a device record, coalescing on `dedup_key()` when the
    /// variant has a host-path identity (§4.3 "two containers referencing
    /// the same host device share one attach"). Variants with no dedup key
    /// (VFIO, vhost-user, network, memory) always get a fresh record.
    pub fn register(&mut self, device: Device) -> DeviceId {
        if let Some(key) = device.dedup_key() {
            if let Some(existing) = self.by_dedup_key.get(&key) {
                return existing.clone();
            }
        }

        let id = self.next_device_id();
        if let Some(key) = device.dedup_key() {
            self.by_dedup_key.insert(key, id.clone());
        }
        self.devices.insert(
            id.clone(),
            DeviceRecord {
                id: id.clone(),
                device,
                attach_count: 0,
                bridge_slot: None,
            },
        );
        id
    }

    pub fn find_device(&self, major: u32, minor: u32) -> Option<DeviceId> {
        self.by_dedup_key.get(&(major, minor)).cloned()
    }

    pub fn get_all_devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.devices
            .get(id)
            .map(|r| r.attach_count > 0)
            .unwrap_or(false)
    }

    /// Bumps the attach-count. Bus allocation only happens on the 0→1
    /// transition (§4.3).
    pub fn attach(&mut self, id: &str) -> Result<Option<(u32, u32)>, DeviceError> {
        let record = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        record.attach_count += 1;
        if record.attach_count == 1 {
            let kind = record.device.bridge_kind();
            let slot = self.bridges.allocate(kind, id)?;
            record.bridge_slot = Some(slot);
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }

    /// Bumps the attach-count down. Bus teardown only happens on the 1→0
    /// transition.
    pub fn detach(&mut self, id: &str) -> Result<bool, DeviceError> {
        let record = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        if record.attach_count == 0 {
            return Ok(false);
        }
        record.attach_count -= 1;
        if record.attach_count == 0 {
            let kind = record.device.bridge_kind();
            if let Some((bridge_id, slot)) = record.bridge_slot.take() {
                self.bridges.release(kind, bridge_id, slot);
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Rebuilds device records from a persisted list, in saved order, for
    /// restart (§4.6 Restore).
    pub fn load_devices(&mut self, devices: Vec<(DeviceId, Device, u32)>) {
        for (id, device, attach_count) in devices {
            self.devices.insert(
                id.clone(),
                DeviceRecord {
                    id,
                    device,
                    attach_count,
                    bridge_slot: None,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_info(path: &str, major: u32, minor: u32) -> DeviceInfo {
        DeviceInfo {
            host_path: path.to_string(),
            major,
            minor,
            requested_driver: BlockDriver::VirtioBlk,
            vhost_user_blk_major: None,
            is_pmem: false,
            hugepages_enabled: false,
        }
    }

    #[test]
    fn attach_count_gates_vm_attachment() {
        let mut dm = DeviceManager::new();
        let id = dm.new_device(block_info("/dev/vda", 8, 0)).unwrap();
        assert!(!dm.is_attached(&id));
        dm.attach(&id).unwrap();
        assert!(dm.is_attached(&id));
        dm.attach(&id).unwrap();
        dm.detach(&id).unwrap();
        assert!(dm.is_attached(&id));
        dm.detach(&id).unwrap();
        assert!(!dm.is_attached(&id));
    }

    #[test]
    fn coalesces_same_host_device_across_containers() {
        let mut dm = DeviceManager::new();
        let a = dm.new_device(block_info("/dev/vda", 8, 0)).unwrap();
        let b = dm.new_device(block_info("/dev/vda", 8, 0)).unwrap();
        assert_eq!(a, b);
        dm.attach(&a).unwrap();
        dm.attach(&b).unwrap();
        assert_eq!(dm.devices.get(&a).unwrap().attach_count, 2);
    }

    #[test]
    fn rejects_missing_host_path() {
        let mut dm = DeviceManager::new();
        assert!(dm.new_device(block_info("", 8, 0)).is_err());
    }

    #[test]
    fn vhost_user_blk_requires_hugepages() {
        let mut dm = DeviceManager::new();
        let mut info = block_info("/dev/vhost-blk0", 240, 0);
        info.vhost_user_blk_major = Some(240);
        info.hugepages_enabled = false;
        assert!(dm.new_device(info).is_err());
    }

    #[test]
    fn register_coalesces_same_block_device() {
        let mut dm = DeviceManager::new();
        let dev = Device::Block {
            path: "/dev/vda".to_string(),
            driver: BlockDriver::VirtioBlk,
            major: 8,
            minor: 0,
        };
        let a = dm.register(dev.clone());
        let b = dm.register(dev);
        assert_eq!(a, b);
        assert_eq!(dm.get_all_devices().count(), 1);
    }

    #[test]
    fn register_does_not_coalesce_devices_without_a_dedup_key() {
        let mut dm = DeviceManager::new();
        let a = dm.register(Device::Vfio {
            bdf: "0000:00:1f.2".to_string(),
            vendor: None,
            device: None,
            iommu_group: 2,
        });
        let b = dm.register(Device::Vfio {
            bdf: "0000:00:1f.2".to_string(),
            vendor: None,
            device: None,
            iommu_group: 2,
        });
        assert_ne!(a, b);
        assert_eq!(dm.get_all_devices().count(), 2);
    }

    #[test]
    fn pmem_uses_nvdimm_driver() {
        let mut dm = DeviceManager::new();
        let mut info = block_info("/mnt/pmem0", 259, 0);
        info.is_pmem = true;
        let id = dm.new_device(info).unwrap();
        match &dm.devices.get(&id).unwrap().device {
            Device::Block { driver, .. } => assert_eq!(*driver, BlockDriver::Nvdimm),
            _ => panic!("expected block device"),
        }
    }
}
