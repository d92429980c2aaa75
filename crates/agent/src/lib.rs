//! Host-side client for the in-guest agent (§4.1).
//!
//! [`Agent`] is the trait the Sandbox engine programs against; [`client::KataAgent`]
//! is the real implementation speaking the wire protocol in [`shared::protocol`]
//! over one of the [`transport::Transport`] kinds, and [`mock::MockAgent`] is the
//! in-memory stand-in used by tests and the scenarios in spec §8.
pub mod client;
pub mod error;
pub mod mock;
pub mod transport;

pub use error::AgentError;
pub use shared::rpc;

use async_trait::async_trait;
use shared::rpc::{
    AgentRequest, DeviceSpec, EphemeralMount, GuestDetails, Interface, Neighbor, OomEvent,
    Process, ResourceUpdate, Route, Signal, StorageSpec,
};
use std::time::Duration;

/// An in-flight operation's deadline/cancellation token (§5 "every operation
/// carries a deadline/cancellation token").
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn no_timeout() -> Self {
        Self { timeout: None }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::no_timeout()
    }
}

/// The request/response surface exposed to the Sandbox engine (§4.1).
///
/// Implementations must be safe to hold behind `Arc<dyn Agent>` and to call
/// concurrently: per §5, requests on the same connection are independent and
/// may complete out of order under long-lived-connection mode.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn connect(&self, ctx: CallContext) -> Result<(), AgentError>;
    async fn disconnect(&self) -> Result<(), AgentError>;
    async fn check(&self, ctx: CallContext) -> Result<(), AgentError>;

    async fn create_sandbox(
        &self,
        ctx: CallContext,
        sandbox_id: &str,
        hostname: &str,
    ) -> Result<(), AgentError>;
    async fn start_sandbox(&self, ctx: CallContext) -> Result<(), AgentError>;
    async fn stop_sandbox(&self, ctx: CallContext) -> Result<(), AgentError>;

    async fn create_container(
        &self,
        ctx: CallContext,
        container_id: &str,
        spec_json: &str,
        devices: Vec<DeviceSpec>,
        storages: Vec<StorageSpec>,
    ) -> Result<(), AgentError>;
    async fn start_container(&self, ctx: CallContext, container_id: &str)
    -> Result<(), AgentError>;
    async fn stop_container(&self, ctx: CallContext, container_id: &str) -> Result<(), AgentError>;
    async fn pause_container(&self, ctx: CallContext, container_id: &str)
    -> Result<(), AgentError>;
    async fn resume_container(
        &self,
        ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError>;

    async fn exec(
        &self,
        ctx: CallContext,
        container_id: &str,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: &str,
        terminal: bool,
    ) -> Result<Process, AgentError>;
    async fn wait_process(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
    ) -> Result<i32, AgentError>;
    async fn signal_process(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<(), AgentError>;
    async fn winsize_process(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), AgentError>;
    async fn write_stdin(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        data: &[u8],
    ) -> Result<(), AgentError>;
    async fn close_stdin(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
    ) -> Result<(), AgentError>;
    async fn read_stdout(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        max_bytes: u32,
    ) -> Result<Vec<u8>, AgentError>;
    async fn read_stderr(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        max_bytes: u32,
    ) -> Result<Vec<u8>, AgentError>;

    async fn update_container(
        &self,
        ctx: CallContext,
        container_id: &str,
        resources: ResourceUpdate,
    ) -> Result<(), AgentError>;
    async fn online_cpu_mem(
        &self,
        ctx: CallContext,
        cpus: u32,
        cpu_only: bool,
    ) -> Result<(), AgentError>;
    async fn mem_hotplug_by_probe(
        &self,
        ctx: CallContext,
        addrs: Vec<u64>,
    ) -> Result<(), AgentError>;

    async fn update_interface(&self, ctx: CallContext, interface: Interface)
    -> Result<(), AgentError>;
    async fn list_interfaces(&self, ctx: CallContext) -> Result<Vec<Interface>, AgentError>;
    async fn update_routes(&self, ctx: CallContext, routes: Vec<Route>) -> Result<(), AgentError>;
    async fn list_routes(&self, ctx: CallContext) -> Result<Vec<Route>, AgentError>;
    async fn add_arp_neighbors(
        &self,
        ctx: CallContext,
        neighbors: Vec<Neighbor>,
    ) -> Result<(), AgentError>;
    async fn update_ephemeral_mounts(
        &self,
        ctx: CallContext,
        mounts: Vec<EphemeralMount>,
    ) -> Result<(), AgentError>;
    async fn reseed_rng(&self, ctx: CallContext, data: Vec<u8>) -> Result<(), AgentError>;
    async fn set_guest_datetime(
        &self,
        ctx: CallContext,
        seconds: i64,
        nanoseconds: i64,
    ) -> Result<(), AgentError>;

    /// Chunked upsert: callers split payloads larger than `max_chunk_size`
    /// into consecutive `(path, offset)` slices themselves (§4.1); each
    /// individual call here is one idempotent slice write.
    async fn copy_file(
        &self,
        ctx: CallContext,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), AgentError>;

    async fn get_guest_details(&self, ctx: CallContext) -> Result<GuestDetails, AgentError>;
    async fn get_oom_event(&self, ctx: CallContext) -> Result<OomEvent, AgentError>;
    async fn get_agent_metrics(&self, ctx: CallContext) -> Result<String, AgentError>;
    async fn get_ip_tables(&self, ctx: CallContext, is_ipv6: bool) -> Result<Vec<u8>, AgentError>;
    async fn set_ip_tables(
        &self,
        ctx: CallContext,
        is_ipv6: bool,
        data: Vec<u8>,
    ) -> Result<(), AgentError>;
    async fn set_policy(&self, ctx: CallContext, policy: &str) -> Result<(), AgentError>;
    async fn resize_guest_volume(
        &self,
        ctx: CallContext,
        guest_path: &str,
        size_bytes: u64,
    ) -> Result<(), AgentError>;
    async fn get_guest_volume_stats(
        &self,
        ctx: CallContext,
        guest_path: &str,
    ) -> Result<(u64, u64), AgentError>;
    async fn add_swap(
        &self,
        ctx: CallContext,
        path: &str,
        size_bytes: u64,
    ) -> Result<(), AgentError>;
}

/// Splits a payload into chunks no larger than `max_chunk_size`, pairing
/// each with the offset it belongs at (§4.1 `copy_file` chunking rule).
pub fn chunk_for_copy(data: &[u8], max_chunk_size: usize) -> Vec<(u64, &[u8])> {
    assert!(max_chunk_size > 0);
    data.chunks(max_chunk_size)
        .enumerate()
        .map(|(i, chunk)| ((i * max_chunk_size) as u64, chunk))
        .collect()
}

/// The default maximum size of one `copy_file` slice or stdio read.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_for_copy_splits_and_offsets() {
        let data = vec![0u8; 25];
        let chunks = chunk_for_copy(&data, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks[1].0, 10);
        assert_eq!(chunks[2].0, 20);
        assert_eq!(chunks[2].1.len(), 5);
    }

    #[test]
    fn empty_payload_produces_no_chunks() {
        let data: Vec<u8> = vec![];
        assert!(chunk_for_copy(&data, 10).is_empty());
    }
}
