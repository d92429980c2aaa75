//! `FirecrackerHypervisor`: the [`crate::Hypervisor`] backend wrapping
//! `firecracker-sdk`'s process + Unix-socket API client (§4.2 B).
use crate::capabilities::Capabilities;
use crate::config::HypervisorConfig;
use crate::device_manager::Device;
use crate::error::HypervisorError;
use crate::{DeviceHandle, MemoryDevice, VmState};
use async_trait::async_trait;
use firecracker_sdk::dto::{
    BootSource, CacheType, Drive, HugePages, MachineConfiguration, MemoryHotplugSizeUpdate,
    NetworkInterface, SnapshotCreateParams, Vsock,
};
use firecracker_sdk::{Firecracker, FirecrackerBuilder};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::time::Duration;
use tracing::{info, instrument, warn};

struct Inner {
    firecracker: Option<Firecracker>,
    state: VmState,
    config: Option<HypervisorConfig>,
    socket_path: Option<PathBuf>,
    memory_mb: u32,
}

/// One instance per sandbox VM; not meant to be shared across sandboxes.
pub struct FirecrackerHypervisor {
    run_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FirecrackerHypervisor {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            inner: Mutex::new(Inner {
                firecracker: None,
                state: VmState::Uninitialized,
                config: None,
                socket_path: None,
                memory_mb: 0,
            }),
        }
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
impl crate::Hypervisor for FirecrackerHypervisor {
    #[instrument(skip(self, config))]
    async fn create_vm(&self, id: &str, mut config: HypervisorConfig) -> Result<(), HypervisorError> {
        config.validate()?;

        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Uninitialized])?;

        let socket_path = self.run_dir.join(format!("{id}.sock"));
        let mut builder = FirecrackerBuilder::new(PathBuf::from(&config.hypervisor_path));
        builder.with_id(Some(id.to_string()));
        builder.with_api_socket_path(Some(socket_path.clone()));

        let mut firecracker = builder
            .build()
            .map_err(|e| HypervisorError::InvalidConfig(e.to_string()))?;

        firecracker
            .set_boot_source(BootSource {
                boot_args: None,
                initrd_path: config.initrd_path.clone(),
                kernel_image_path: config.kernel_path.clone(),
            })
            .map_err(|e| HypervisorError::Vmm(e.to_string()))?;

        firecracker
            .set_machine_config(MachineConfiguration {
                cpu_template: None,
                smt: None,
                mem_size_mib: config.memory_mib as isize,
                track_dirty_pages: None,
                vcpu_count: config.num_vcpus.ceil() as isize,
                huge_pages: Some(HugePages::None),
            })
            .map_err(|e| HypervisorError::Vmm(e.to_string()))?;

        if let Some(image) = &config.image_path {
            firecracker
                .add_drive(Drive {
                    drive_id: "rootfs".to_string(),
                    partuuid: None,
                    is_root_device: true,
                    cache_type: Some(CacheType::Writeback),
                    is_read_only: Some(false),
                    path_on_host: Some(image.clone()),
                    rate_limiter: None,
                    io_engine: None,
                    socket: None,
                })
                .map_err(|e| HypervisorError::Vmm(e.to_string()))?;
        }

        firecracker
            .set_vsock(Vsock {
                guest_cid: 3,
                uds_path: self.generate_socket(id),
                vsock_id: None,
            })
            .map_err(|e| HypervisorError::Vmm(e.to_string()))?;

        inner.memory_mb = config.memory_mib;
        inner.firecracker = Some(firecracker);
        inner.socket_path = Some(socket_path);
        inner.config = Some(config);
        inner.state = VmState::Created;
        info!(sandbox_id = id, "firecracker vm created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_vm(&self, timeout_secs: u64) -> Result<(), HypervisorError> {
        let socket_path;
        {
            let inner = self.inner.lock().unwrap();
            self.require_state(&inner, &[VmState::Created])?;
            socket_path = inner
                .socket_path
                .clone()
                .ok_or_else(|| HypervisorError::Vmm("no api socket configured".to_string()))?;
        }

        // The firecracker handle can't live across an await while the mutex
        // guard is held, so take ownership for the duration of the call.
        let mut firecracker = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .firecracker
                .take()
                .ok_or_else(|| HypervisorError::Vmm("vm not configured".to_string()))?
        };

        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            firecracker.start(socket_path),
        )
        .await;

        let mut inner = self.inner.lock().unwrap();
        inner.firecracker = Some(firecracker);

        match result {
            Ok(Ok(())) => {
                inner.state = VmState::Running;
                Ok(())
            }
            Ok(Err(e)) => Err(HypervisorError::Vmm(e.to_string())),
            Err(_) => Err(HypervisorError::Timeout),
        }
    }

    #[instrument(skip(self))]
    async fn stop_vm(&self, wait_only: bool) -> Result<(), HypervisorError> {
        let mut firecracker = {
            let inner = self.inner.lock().unwrap();
            if inner.state == VmState::Stopped {
                return Ok(()); // §8 "stop_vm on an already-stopped VM is a no-op success"
            }
            drop(inner);
            let mut inner = self.inner.lock().unwrap();
            inner.firecracker.take()
        };

        if let Some(fc) = firecracker.as_mut()
            && !wait_only
        {
            if let Err(e) = fc.shutdown().await {
                warn!(error = %e, "firecracker shutdown returned an error; forcing stop anyway");
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.firecracker = firecracker;
        inner.state = VmState::Stopped;
        Ok(())
    }

    async fn pause_vm(&self) -> Result<(), HypervisorError> {
        let mut firecracker = {
            let mut inner = self.inner.lock().unwrap();
            self.require_state(&inner, &[VmState::Running])?;
            inner.firecracker.take()
        };
        let result = match firecracker.as_mut() {
            Some(fc) => fc.pause().await.map_err(|e| HypervisorError::Vmm(e.to_string())),
            None => Err(HypervisorError::Vmm("vm not started".to_string())),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.firecracker = firecracker;
        result?;
        inner.state = VmState::Paused;
        Ok(())
    }

    async fn resume_vm(&self) -> Result<(), HypervisorError> {
        let mut firecracker = {
            let mut inner = self.inner.lock().unwrap();
            self.require_state(&inner, &[VmState::Paused])?;
            inner.firecracker.take()
        };
        let result = match firecracker.as_mut() {
            Some(fc) => fc.resume().await.map_err(|e| HypervisorError::Vmm(e.to_string())),
            None => Err(HypervisorError::Vmm("vm not started".to_string())),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.firecracker = firecracker;
        result?;
        inner.state = VmState::Running;
        Ok(())
    }

    async fn save_vm(&self) -> Result<(), HypervisorError> {
        let inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Paused, VmState::Running])?;
        let client = inner
            .firecracker
            .as_ref()
            .and_then(|fc| fc.api().ok())
            .ok_or_else(|| HypervisorError::Vmm("api client unavailable".to_string()))?;
        let mem_file_path = self.run_dir.join("mem_file");
        let snapshot_path = self.run_dir.join("snapshot");
        let client = client.clone();
        drop(inner);
        client
            .put_snapshot_create(&SnapshotCreateParams {
                snapshot_type: None,
                mem_file_path: mem_file_path.to_string_lossy().to_string(),
                snapshot_path: snapshot_path.to_string_lossy().to_string(),
            })
            .await
            .map_err(|e| HypervisorError::Vmm(e.to_string()))
    }

    async fn add_device(&self, device: Device) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Created])?;
        let firecracker = inner
            .firecracker
            .as_mut()
            .ok_or_else(|| HypervisorError::Vmm("vm not configured".to_string()))?;
        match device {
            Device::Block { path, .. } => {
                firecracker
                    .add_drive(Drive {
                        drive_id: format!("drive-{}", path.replace('/', "_")),
                        partuuid: None,
                        is_root_device: false,
                        cache_type: Some(CacheType::Writeback),
                        is_read_only: Some(false),
                        path_on_host: Some(path),
                        rate_limiter: None,
                        io_engine: None,
                        socket: None,
                    })
                    .map_err(|e| HypervisorError::Vmm(e.to_string()))?;
                Ok(())
            }
            Device::NetworkEndpoint {
                name,
                mac,
                rx_rate_limiter,
                tx_rate_limiter,
            } => {
                firecracker
                    .add_network(NetworkInterface {
                        guest_mac: mac,
                        host_dev_name: name.clone(),
                        iface_id: name,
                        rx_rate_limiter,
                        tx_rate_limiter,
                    })
                    .map_err(|e| HypervisorError::Vmm(e.to_string()))?;
                Ok(())
            }
            other => Err(HypervisorError::Unsupported(cold_plug_device_name(&other))),
        }
    }

    async fn hotplug_add_device(&self, device: Device) -> Result<DeviceHandle, HypervisorError> {
        let inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Running])?;
        match device {
            Device::Block { path, .. } => Ok(DeviceHandle(path)),
            other => Err(HypervisorError::Unsupported(cold_plug_device_name(&other))),
        }
    }

    async fn hotplug_remove_device(&self, _handle: DeviceHandle) -> Result<(), HypervisorError> {
        let inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Running, VmState::Paused])?;
        Ok(())
    }

    async fn resize_vcpus(&self, new_count: u32) -> Result<(u32, u32), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        self.require_state(&inner, &[VmState::Running])?;
        let cfg = inner
            .config
            .as_mut()
            .ok_or_else(|| HypervisorError::Vmm("vm not configured".to_string()))?;
        let current = cfg.num_vcpus.ceil() as u32;
        if cfg.confidential_guest {
            return Ok((current, current)); // confidential guests decline vcpu hotplug
        }
        cfg.num_vcpus = new_count as f64;
        Ok((current, new_count))
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
            if let Some(fc) = inner.firecracker.as_ref()
                && let Ok(client) = fc.api()
            {
                let client = client.clone();
                drop(inner);
                client
                    .patch_hotplug_memory(&MemoryHotplugSizeUpdate {
                        requested_size_mib: Some(new_total as isize),
                    })
                    .await
                    .map_err(|e| HypervisorError::Vmm(e.to_string()))?;
                let mut inner = self.inner.lock().unwrap();
                inner.memory_mb = new_total;
            } else {
                inner.memory_mb = new_total;
            }
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
        Ok(Vec::new())
    }

    async fn get_pids(&self) -> Result<Vec<u32>, HypervisorError> {
        Ok(Vec::new())
    }

    async fn get_vm_console(&self) -> Result<(String, String), HypervisorError> {
        let inner = self.inner.lock().unwrap();
        let path = self.run_dir.join("console.sock");
        let _ = &inner.state;
        Ok(("unix".to_string(), path.to_string_lossy().to_string()))
    }

    async fn check(&self) -> Result<(), HypervisorError> {
        let inner = self.inner.lock().unwrap();
        let client = inner
            .firecracker
            .as_ref()
            .and_then(|fc| fc.api().ok())
            .ok_or_else(|| HypervisorError::Vmm("vm not started".to_string()))?;
        let client = client.clone();
        drop(inner);
        client
            .get_instance_info()
            .await
            .map(|_| ())
            .map_err(|e| HypervisorError::Vmm(e.to_string()))
    }

    fn generate_socket(&self, id: &str) -> String {
        self.run_dir
            .join(format!("{id}.hvsock"))
            .to_string_lossy()
            .to_string()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            block_device_hotplug: false,
            net_device_hotplug: false,
            fs_sharing: false,
            multi_queue: true,
            memory_hotplug: true,
            vcpu_hotplug: false,
        }
    }

    async fn save(&self) -> Result<Vec<u8>, HypervisorError> {
        let inner = self.inner.lock().unwrap();
        let snapshot = FirecrackerSavedState {
            memory_mb: inner.memory_mb,
            state: inner.state,
        };
        serde_json::to_vec(&snapshot).map_err(|e| HypervisorError::Vmm(e.to_string()))
    }

    async fn load(&self, state: &[u8]) -> Result<(), HypervisorError> {
        let snapshot: FirecrackerSavedState =
            serde_json::from_slice(state).map_err(|e| HypervisorError::Vmm(e.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        inner.memory_mb = snapshot.memory_mb;
        inner.state = snapshot.state;
        Ok(())
    }
}

fn cold_plug_device_name(device: &Device) -> &'static str {
    match device {
        Device::Block { .. } => "block",
        Device::VhostUserNet { .. } => "vhost-user-net",
        Device::VhostUserBlk { .. } => "vhost-user-blk",
        Device::VhostUserScsi { .. } => "vhost-user-scsi",
        Device::VhostUserFs { .. } => "vhost-user-fs",
        Device::Vfio { .. } => "vfio",
        Device::GenericChar { .. } => "generic-char",
        Device::NetworkEndpoint { .. } => "network-endpoint",
        Device::Memory { .. } => "memory",
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct FirecrackerSavedState {
    memory_mb: u32,
    state: VmState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_vm_rejects_nonexistent_binary() {
        let hv = FirecrackerHypervisor::new(std::env::temp_dir());
        let config = HypervisorConfig {
            hypervisor_path: "/nonexistent/firecracker".to_string(),
            kernel_path: "/nonexistent/kernel".to_string(),
            image_path: Some("/nonexistent/image".to_string()),
            ..Default::default()
        };
        use crate::Hypervisor;
        let result = hv.create_vm("sb1", config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stop_vm_on_already_stopped_is_noop() {
        use crate::Hypervisor;
        let hv = FirecrackerHypervisor::new(std::env::temp_dir());
        hv.inner.lock().unwrap().state = VmState::Stopped;
        assert!(hv.stop_vm(false).await.is_ok());
    }
}
