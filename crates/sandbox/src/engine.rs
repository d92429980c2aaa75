//! §4.5 Sandbox Engine (F) and Container Lifecycle (G): create/start/stop/
//! pause/resume/delete, grounded on the step sequence spelled out there and
//! on the `ResourceManagerInner` composition in the resource crate.
use crate::config::{SandboxConfig, VfioMode};
use crate::container::{Container, ContainerState, RootFs};
use crate::error::SandboxError;
use crate::rollback::{RollbackAction, RollbackStack};
use crate::state::{self, SandboxState};
use agent::{Agent, CallContext};
use hypervisor::device_manager::Device;
use hypervisor::Hypervisor;
use persist::{PersistStore, PersistedSandboxState};
use resource::ResourceManager;
use shared::rpc::Signal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

struct Inner {
    state: SandboxState,
    containers: HashMap<String, Container>,
}

/// Owns exactly one Hypervisor and one Agent for its lifetime (§3
/// invariant); destruction tears down the VM and every contained
/// Container.
pub struct SandboxEngine {
    id: String,
    resources: ResourceManager,
    store: PersistStore,
    inner: Mutex<Inner>,
}

impl SandboxEngine {
    /// §4.5 "Create sandbox", steps 1-9. The hypervisor/agent backends are
    /// supplied by the caller's factory (§9 "Mock variant selected at
    /// construction time"), not chosen here.
    #[tracing::instrument(skip(config, hypervisor, agent), fields(sandbox_id = %config.id))]
    pub async fn create(
        config: SandboxConfig,
        hypervisor: Arc<dyn Hypervisor>,
        agent: Arc<dyn Agent>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;

        let store = PersistStore::new(config.run_store.clone());
        let mut rollback = RollbackStack::new();

        let dir = config.run_store.join(&config.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::InvalidConfig(format!("reserving {dir:?}: {e}")))?;
        rollback.push(RollbackAction::DestroyPersistDir);

        if let Err(e) = hypervisor.create_vm(&config.id, config.hypervisor_config.clone()).await {
            rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
            return Err(e.into());
        }
        rollback.push(RollbackAction::StopVm);

        let resources = ResourceManager::new(config.id.clone(), agent.clone(), hypervisor.clone());

        // §4.4 network endpoints cold-attach while the VM is still in
        // `Created` state, before `start_vm` boots it.
        for ep_spec in &config.network_endpoints {
            let endpoint = match resource::NetworkEndpoint::new(
                ep_spec.name.clone(),
                ep_spec.hardware_addr.clone(),
                ep_spec.kind,
                ep_spec.bridging,
            ) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
                    return Err(e.into());
                }
            };
            if let Err(e) = resources.add_network_endpoint(endpoint).await {
                rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
                return Err(e.into());
            }
        }

        // §4.3 container devices (VFIO passthrough, pmem rootfs) cold-attach
        // here too: the VM is still `Created`, matching the same state
        // guard the network endpoints above rely on.
        let mut containers = HashMap::new();
        for spec in &config.containers {
            let mut rootfs = RootFs {
                path: spec.rootfs_path.clone(),
                block_device_id: None,
                fs_type: spec.fs_type.clone(),
                mount_options: Vec::new(),
            };

            // §4.3 "Pmem block devices use a dedicated driver and expose a
            // `dax` mount option."
            if let Some(pmem) = spec.pmem_rootfs {
                let id = resources
                    .attach_device(Device::Block {
                        path: spec.rootfs_path.clone(),
                        driver: hypervisor::device_manager::BlockDriver::Nvdimm,
                        major: pmem.major,
                        minor: pmem.minor,
                    })
                    .await;
                match id {
                    Ok(id) => {
                        rootfs.block_device_id = Some(id);
                        rootfs.mount_options.push("dax".to_string());
                    }
                    Err(e) => {
                        rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
                        return Err(e.into());
                    }
                }
            }

            let mut container = Container::new(spec.id.clone(), rootfs);

            // §8 S6: guest-kernel VFIO devices are handled by the guest's
            // own driver and must never reach the Device Manager.
            for dev in &spec.devices {
                if dev.mode == VfioMode::GuestKernel {
                    tracing::info!(
                        container_id = %spec.id,
                        bdf = %dev.bdf,
                        iommu_group = dev.iommu_group,
                        "skipping device manager registration for guest-kernel vfio device"
                    );
                    continue;
                }
                let id = resources
                    .attach_device(Device::Vfio {
                        bdf: dev.bdf.clone(),
                        vendor: None,
                        device: None,
                        iommu_group: dev.iommu_group,
                    })
                    .await;
                match id {
                    Ok(id) => container.device_ids.push(id),
                    Err(e) => {
                        rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
                        return Err(e.into());
                    }
                }
            }

            containers.insert(spec.id.clone(), container);
        }

        if let Err(e) = agent.connect(CallContext::default()).await {
            rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
            return Err(e.into());
        }
        rollback.push(RollbackAction::DisconnectAgent);

        if let Err(e) = hypervisor.start_vm(30).await {
            rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
            return Err(e.into());
        }

        if !config.boot_from_template {
            if let Err(e) = agent.check(CallContext::default()).await {
                rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
                return Err(e.into());
            }
        }

        // §4.4 "On Sandbox start, scan the netns and synchronize its
        // interfaces/routes/neighbors to the guest."
        if let Err(e) = resources.sync_network_to_guest(Vec::new(), Vec::new()).await {
            rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
            return Err(e.into());
        }

        let mut sandbox_state = SandboxState::Creating;
        state::transition(&mut sandbox_state, SandboxState::Ready)?;
        state::transition(&mut sandbox_state, SandboxState::Running)?;

        for spec in &config.containers {
            if let Err(e) = agent
                .create_container(CallContext::default(), &spec.id, "{}", Vec::new(), Vec::new())
                .await
            {
                rollback.unwind(&config.id, &hypervisor, &agent, &store).await;
                return Err(e.into());
            }
        }

        let engine = Self {
            id: config.id.clone(),
            resources,
            store,
            inner: Mutex::new(Inner {
                state: sandbox_state,
                containers,
            }),
        };
        engine.persist().await?;
        tracing::info!(sandbox_id = %engine.id, "sandbox created");
        Ok(engine)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub async fn state(&self) -> SandboxState {
        self.inner.lock().await.state
    }

    async fn persist(&self) -> Result<(), SandboxError> {
        let inner = self.inner.lock().await;
        let hv_state = self.resources.hypervisor().save().await.unwrap_or_default();
        let mut persisted = PersistedSandboxState::new(inner.state.name());
        persisted.hypervisor_state = hv_state;
        for (id, container) in &inner.containers {
            persisted.containers.insert(
                id.clone(),
                persist::ContainerState {
                    state: container.state().name().to_string(),
                    rootfs_block_ref: container.rootfs.block_device_id.clone(),
                    fs_type: container.rootfs.fs_type.clone(),
                    cgroup_path: container.cgroup_path.clone(),
                    device_ids: container.device_ids.clone(),
                    process_token: container.process.as_ref().map(|p| p.token.clone()),
                    mounts: container.mounts.iter().map(|m| m.destination.clone()).collect(),
                },
            );
        }
        self.store.save(&self.id, &persisted).await?;
        Ok(())
    }

    pub async fn start_container(&self, container_id: &str) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SandboxState::Running {
            return Err(SandboxError::InvalidState {
                current: inner.state.name(),
                requested: "running",
            });
        }
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| SandboxError::NotFound {
                kind: "container",
                id: container_id.to_string(),
            })?;
        self.resources
            .agent()
            .start_container(CallContext::default(), container_id)
            .await?;
        container.transition(ContainerState::Running)?;
        drop(inner);
        self.persist().await
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| SandboxError::NotFound {
                kind: "container",
                id: container_id.to_string(),
            })?;
        self.resources
            .agent()
            .stop_container(CallContext::default(), container_id)
            .await?;
        container.transition(ContainerState::Stopped)?;
        drop(inner);
        self.persist().await
    }

    pub async fn exec(
        &self,
        container_id: &str,
        argv: Vec<String>,
    ) -> Result<shared::rpc::Process, SandboxError> {
        self.resources
            .agent()
            .exec(
                CallContext::default(),
                container_id,
                argv,
                Vec::new(),
                "/",
                false,
            )
            .await
            .map_err(Into::into)
    }

    pub async fn wait_process(
        &self,
        container_id: &str,
        process_id: &str,
    ) -> Result<i32, SandboxError> {
        self.resources
            .agent()
            .wait_process(CallContext::default(), container_id, process_id)
            .await
            .map_err(Into::into)
    }

    pub async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<(), SandboxError> {
        self.resources
            .agent()
            .signal_process(CallContext::default(), container_id, process_id, signal, all)
            .await
            .map_err(Into::into)
    }

    pub async fn pause(&self) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        state::transition(&mut inner.state, SandboxState::Paused)?;
        self.resources.hypervisor().pause_vm().await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        state::transition(&mut inner.state, SandboxState::Running)?;
        self.resources.hypervisor().resume_vm().await?;
        Ok(())
    }

    /// §4.5 "Stop all containers; stop the VM... tear down network
    /// endpoints; free devices; delete persisted state; remove storage
    /// directory." Split from `delete` so a caller can stop without
    /// destroying persisted state (matches the Sandbox state machine's
    /// `Running -> Stopped` transition independent from deletion).
    pub async fn stop(&self) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        for container in inner.containers.values_mut() {
            if matches!(container.state(), ContainerState::Running | ContainerState::Paused) {
                if let Err(e) = self
                    .resources
                    .agent()
                    .stop_container(CallContext::default(), &container.id)
                    .await
                {
                    tracing::warn!(container_id = %container.id, %e, "stop_container failed, continuing");
                }
                let _ = container.transition(ContainerState::Stopped);
            }
        }
        state::transition(&mut inner.state, SandboxState::Stopped)?;
        if let Err(e) = self.resources.hypervisor().stop_vm(false).await {
            tracing::warn!(sandbox_id = %self.id, %e, "stop_vm failed, continuing");
        }
        drop(inner);
        self.persist().await
    }

    pub async fn delete(&self) -> Result<(), SandboxError> {
        if self.state().await != SandboxState::Stopped {
            self.stop().await?;
        }
        self.store.destroy(&self.id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerSpec;
    use hypervisor::mock::MockHypervisor;

    fn config(run_store: std::path::PathBuf) -> SandboxConfig {
        SandboxConfig {
            id: "sb1".to_string(),
            hostname: "sb1".to_string(),
            run_store,
            hypervisor_config: hypervisor::HypervisorConfig {
                hypervisor_path: "/bin/true".to_string(),
                kernel_path: "/boot/vmlinux".to_string(),
                image_path: Some("/var/lib/rootfs.img".to_string()),
                ..Default::default()
            },
            containers: vec![ContainerSpec {
                id: "c1".to_string(),
                rootfs_path: "/".to_string(),
                fs_type: "ext4".to_string(),
                command: vec!["/bin/sh".to_string()],
                devices: Vec::new(),
                pmem_rootfs: None,
            }],
            network_endpoints: Vec::new(),
            boot_from_template: false,
        }
    }

    /// S1: create-start-exec-stop.
    #[tokio::test]
    async fn create_start_exec_stop_delete_flow() {
        let dir = tempfile::tempdir().unwrap();
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let ag: Arc<dyn Agent> = Arc::new(agent::mock::MockAgent::new());

        let engine = SandboxEngine::create(config(dir.path().to_path_buf()), hv, ag)
            .await
            .unwrap();
        assert_eq!(engine.state().await, SandboxState::Running);
        assert!(engine.store.exists("sb1"));

        engine.start_container("c1").await.unwrap();
        let proc = engine.exec("c1", vec!["/bin/true".to_string()]).await.unwrap();
        let code = engine.wait_process("c1", &proc.token).await.unwrap();
        assert_eq!(code, 0);

        engine.stop().await.unwrap();
        assert_eq!(engine.state().await, SandboxState::Stopped);

        engine.delete().await.unwrap();
        assert!(!engine.store.exists("sb1"));
    }

    /// S2: rollback on missing hypervisor binary.
    #[tokio::test]
    async fn rollback_on_hypervisor_create_failure_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let hv = MockHypervisor::new();
        hv.fail_next_create();
        let hv: Arc<dyn Hypervisor> = Arc::new(hv);
        let ag: Arc<dyn Agent> = Arc::new(agent::mock::MockAgent::new());

        let store = PersistStore::new(dir.path());
        let err = SandboxEngine::create(config(dir.path().to_path_buf()), hv, ag)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Hypervisor(_)));
        assert!(!store.exists("sb1"));
        assert!(!dir.path().join("sb1").exists());
    }

    /// §4.4: a configured network endpoint reaches the hypervisor as a real
    /// cold-attached device, not just in-memory bookkeeping.
    #[tokio::test]
    async fn configured_network_endpoint_is_wired_into_the_vm() {
        use crate::config::NetworkEndpointSpec;

        let dir = tempfile::tempdir().unwrap();
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let ag: Arc<dyn Agent> = Arc::new(agent::mock::MockAgent::new());

        let mut cfg = config(dir.path().to_path_buf());
        cfg.network_endpoints.push(NetworkEndpointSpec {
            name: "eth0".to_string(),
            hardware_addr: "aa:bb:cc:dd:ee:ff".to_string(),
            kind: resource::EndpointKind::Tap,
            bridging: resource::BridgingStrategy::Default,
        });

        let engine = SandboxEngine::create(cfg, hv, ag).await.unwrap();
        assert_eq!(engine.resources.endpoint_count().await, 1);
    }

    /// §4.3: a pmem-backed rootfs attaches through the Nvdimm driver and
    /// carries the `dax` mount option.
    #[tokio::test]
    async fn pmem_rootfs_attaches_nvdimm_device_and_sets_dax_option() {
        use crate::config::PmemRootfs;

        let dir = tempfile::tempdir().unwrap();
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let ag: Arc<dyn Agent> = Arc::new(agent::mock::MockAgent::new());

        let mut cfg = config(dir.path().to_path_buf());
        cfg.containers[0].pmem_rootfs = Some(PmemRootfs { major: 259, minor: 0 });

        let engine = SandboxEngine::create(cfg, hv, ag).await.unwrap();
        let inner = engine.inner.lock().await;
        let container = &inner.containers["c1"];
        assert!(container.rootfs.block_device_id.is_some());
        assert_eq!(container.rootfs.mount_options, vec!["dax".to_string()]);
    }

    /// S6: a guest-kernel-mode VFIO device is skipped from Device Manager
    /// registration but the container still starts.
    #[tokio::test]
    async fn guest_kernel_vfio_device_is_skipped_but_container_starts() {
        use crate::config::{VfioDeviceRequest, VfioMode};

        let dir = tempfile::tempdir().unwrap();
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let ag: Arc<dyn Agent> = Arc::new(agent::mock::MockAgent::new());

        let mut cfg = config(dir.path().to_path_buf());
        cfg.containers[0].devices.push(VfioDeviceRequest {
            bdf: "0000:00:1f.2".to_string(),
            iommu_group: 2,
            mode: VfioMode::GuestKernel,
        });

        let engine = SandboxEngine::create(cfg, hv, ag).await.unwrap();
        assert_eq!(engine.state().await, SandboxState::Running);
        assert_eq!(engine.resources.device_manager().read().await.get_all_devices().count(), 0);

        engine.start_container("c1").await.unwrap();
        assert_eq!(
            engine.inner.lock().await.containers["c1"].device_ids.len(),
            0
        );
    }
}
