//! In-memory [`crate::Agent`] used by tests and the scenarios in spec §8.
//! Tracks just enough state (sandbox/container lifecycle, exit codes, a
//! fake interface table) to let the Sandbox engine's own tests run without
//! a real guest.
use crate::error::AgentError;
use crate::{Agent, CallContext};
use async_trait::async_trait;
use shared::rpc::{
    DeviceSpec, EphemeralMount, GuestDetails, GuestErrorKind, Interface, Neighbor, OomEvent,
    Process, ResourceUpdate, Route, Signal, StorageSpec,
};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct ContainerState {
    running: bool,
    paused: bool,
    next_process: u64,
    exit_codes: HashMap<String, i32>,
}

/// Built via [`MockAgent::builder`] so tests can preload exit codes or force
/// a particular call to fail, rather than hand-rolling a fresh struct each
/// time (the "factory" §9 refers to for injecting a Mock variant).
#[derive(Default)]
pub struct MockAgent {
    state: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    connected: bool,
    sandbox_started: bool,
    containers: HashMap<String, ContainerState>,
    interfaces: Vec<Interface>,
    routes: Vec<Route>,
    fail_next_check: bool,
    default_exit_code: i32,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: the next `check()` call returns a transport error, then
    /// subsequent calls succeed again.
    pub fn fail_next_check(&self) {
        self.state.lock().unwrap().fail_next_check = true;
    }

    pub fn set_default_exit_code(&self, code: i32) {
        self.state.lock().unwrap().default_exit_code = code;
    }

    pub fn is_container_running(&self, container_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.running)
            .unwrap_or(false)
    }
}

fn not_found(what: &str) -> AgentError {
    AgentError::Guest {
        kind: GuestErrorKind::NotFound,
        message: format!("{what} not found"),
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn connect(&self, _ctx: CallContext) -> Result<(), AgentError> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    async fn check(&self, _ctx: CallContext) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_check {
            state.fail_next_check = false;
            return Err(AgentError::Transport("mock: forced failure".to_string()));
        }
        Ok(())
    }

    async fn create_sandbox(
        &self,
        _ctx: CallContext,
        _sandbox_id: &str,
        _hostname: &str,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn start_sandbox(&self, _ctx: CallContext) -> Result<(), AgentError> {
        self.state.lock().unwrap().sandbox_started = true;
        Ok(())
    }

    async fn stop_sandbox(&self, _ctx: CallContext) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        state.sandbox_started = false;
        state.containers.clear();
        Ok(())
    }

    async fn create_container(
        &self,
        _ctx: CallContext,
        container_id: &str,
        _spec_json: &str,
        _devices: Vec<DeviceSpec>,
        _storages: Vec<StorageSpec>,
    ) -> Result<(), AgentError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container_id.to_string(), ContainerState::default());
        Ok(())
    }

    async fn start_container(
        &self,
        _ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found(container_id))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(
        &self,
        _ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found(container_id))?;
        container.running = false;
        Ok(())
    }

    async fn pause_container(
        &self,
        _ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found(container_id))?;
        container.paused = true;
        Ok(())
    }

    async fn resume_container(
        &self,
        _ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found(container_id))?;
        container.paused = false;
        Ok(())
    }

    async fn exec(
        &self,
        _ctx: CallContext,
        container_id: &str,
        _argv: Vec<String>,
        _env: Vec<(String, String)>,
        _cwd: &str,
        _terminal: bool,
    ) -> Result<Process, AgentError> {
        let mut state = self.state.lock().unwrap();
        let default_code = state.default_exit_code;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found(container_id))?;
        let id = container.next_process;
        container.next_process += 1;
        let token = format!("proc-{id}");
        container.exit_codes.insert(token.clone(), default_code);
        Ok(Process {
            token,
            pid: 1000 + id as i32,
            start_time_epoch_ms: 0,
        })
    }

    async fn wait_process(
        &self,
        _ctx: CallContext,
        container_id: &str,
        process_id: &str,
    ) -> Result<i32, AgentError> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| not_found(container_id))?;
        container
            .exit_codes
            .get(process_id)
            .copied()
            .ok_or_else(|| not_found(process_id))
    }

    async fn signal_process(
        &self,
        _ctx: CallContext,
        container_id: &str,
        _process_id: &str,
        _signal: Signal,
        _all: bool,
    ) -> Result<(), AgentError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(container_id)
            .map(|_| ())
            .ok_or_else(|| not_found(container_id))
    }

    async fn winsize_process(
        &self,
        _ctx: CallContext,
        _container_id: &str,
        _process_id: &str,
        _rows: u16,
        _cols: u16,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write_stdin(
        &self,
        _ctx: CallContext,
        _container_id: &str,
        _process_id: &str,
        _data: &[u8],
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn close_stdin(
        &self,
        _ctx: CallContext,
        _container_id: &str,
        _process_id: &str,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn read_stdout(
        &self,
        _ctx: CallContext,
        _container_id: &str,
        _process_id: &str,
        _max_bytes: u32,
    ) -> Result<Vec<u8>, AgentError> {
        Ok(Vec::new())
    }

    async fn read_stderr(
        &self,
        _ctx: CallContext,
        _container_id: &str,
        _process_id: &str,
        _max_bytes: u32,
    ) -> Result<Vec<u8>, AgentError> {
        Ok(Vec::new())
    }

    async fn update_container(
        &self,
        _ctx: CallContext,
        container_id: &str,
        _resources: ResourceUpdate,
    ) -> Result<(), AgentError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(container_id)
            .map(|_| ())
            .ok_or_else(|| not_found(container_id))
    }

    async fn online_cpu_mem(
        &self,
        _ctx: CallContext,
        _cpus: u32,
        _cpu_only: bool,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn mem_hotplug_by_probe(
        &self,
        _ctx: CallContext,
        _addrs: Vec<u64>,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn update_interface(
        &self,
        _ctx: CallContext,
        interface: Interface,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        state.interfaces.retain(|i| i.name != interface.name);
        state.interfaces.push(interface);
        Ok(())
    }

    async fn list_interfaces(&self, _ctx: CallContext) -> Result<Vec<Interface>, AgentError> {
        Ok(self.state.lock().unwrap().interfaces.clone())
    }

    async fn update_routes(
        &self,
        _ctx: CallContext,
        routes: Vec<Route>,
    ) -> Result<(), AgentError> {
        self.state.lock().unwrap().routes = routes;
        Ok(())
    }

    async fn list_routes(&self, _ctx: CallContext) -> Result<Vec<Route>, AgentError> {
        Ok(self.state.lock().unwrap().routes.clone())
    }

    async fn add_arp_neighbors(
        &self,
        _ctx: CallContext,
        _neighbors: Vec<Neighbor>,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn update_ephemeral_mounts(
        &self,
        _ctx: CallContext,
        _mounts: Vec<EphemeralMount>,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn reseed_rng(&self, _ctx: CallContext, _data: Vec<u8>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn set_guest_datetime(
        &self,
        _ctx: CallContext,
        _seconds: i64,
        _nanoseconds: i64,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn copy_file(
        &self,
        _ctx: CallContext,
        _path: &str,
        _offset: u64,
        _data: &[u8],
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn get_guest_details(&self, _ctx: CallContext) -> Result<GuestDetails, AgentError> {
        Ok(GuestDetails {
            kernel_release: "mock".to_string(),
            agent_version: "mock".to_string(),
            init_daemon_pid: 1,
        })
    }

    async fn get_oom_event(&self, _ctx: CallContext) -> Result<OomEvent, AgentError> {
        Err(AgentError::Guest {
            kind: GuestErrorKind::Unimplemented,
            message: "mock: no oom events pending".to_string(),
        })
    }

    async fn get_agent_metrics(&self, _ctx: CallContext) -> Result<String, AgentError> {
        Ok(String::new())
    }

    async fn get_ip_tables(&self, _ctx: CallContext, _is_ipv6: bool) -> Result<Vec<u8>, AgentError> {
        Ok(Vec::new())
    }

    async fn set_ip_tables(
        &self,
        _ctx: CallContext,
        _is_ipv6: bool,
        _data: Vec<u8>,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn set_policy(&self, _ctx: CallContext, _policy: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn resize_guest_volume(
        &self,
        _ctx: CallContext,
        _guest_path: &str,
        _size_bytes: u64,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn get_guest_volume_stats(
        &self,
        _ctx: CallContext,
        _guest_path: &str,
    ) -> Result<(u64, u64), AgentError> {
        Ok((0, 0))
    }

    async fn add_swap(
        &self,
        _ctx: CallContext,
        _path: &str,
        _size_bytes: u64,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_start_exec_stop_flow() {
        let agent = MockAgent::new();
        let ctx = CallContext::no_timeout();
        agent.create_sandbox(ctx, "sb1", "host1").await.unwrap();
        agent.start_sandbox(ctx).await.unwrap();
        agent
            .create_container(ctx, "c1", "{}", vec![], vec![])
            .await
            .unwrap();
        agent.start_container(ctx, "c1").await.unwrap();
        assert!(agent.is_container_running("c1"));

        let proc = agent
            .exec(ctx, "c1", vec!["true".to_string()], vec![], "/", false)
            .await
            .unwrap();
        let code = agent.wait_process(ctx, "c1", &proc.token).await.unwrap();
        assert_eq!(code, 0);

        agent.stop_container(ctx, "c1").await.unwrap();
        assert!(!agent.is_container_running("c1"));
    }

    #[tokio::test]
    async fn check_can_be_forced_to_fail_once() {
        let agent = MockAgent::new();
        agent.fail_next_check();
        assert!(agent.check(CallContext::no_timeout()).await.is_err());
        assert!(agent.check(CallContext::no_timeout()).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_container_is_not_found() {
        let agent = MockAgent::new();
        let err = agent
            .start_container(CallContext::no_timeout(), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Guest {
                kind: GuestErrorKind::NotFound,
                ..
            }
        ));
    }
}
