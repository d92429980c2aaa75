//! The real [`crate::Agent`] implementation: dials a [`Transport`], frames
//! requests/responses with [`shared::protocol`], and multiplexes concurrent
//! callers over one connection when `long_live` is enabled (§4.1, §5).
use crate::error::AgentError;
use crate::transport::{Conn, Transport};
use crate::{CallContext, chunk_for_copy};
use async_trait::async_trait;
use shared::protocol;
use shared::rpc::{
    AgentRequest, AgentResponse, DeviceSpec, EphemeralMount, GuestDetails, GuestErrorKind,
    Interface, Neighbor, Process, ResourceUpdate, Route, Signal, StorageSpec,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<AgentResponse>>>>;

struct Connected {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    reader_task: tokio::task::JoinHandle<()>,
}

impl Drop for Connected {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Host-side client speaking to the in-guest agent.
pub struct KataAgent {
    transport: Transport,
    long_live: bool,
    next_id: AtomicU64,
    max_chunk_size: usize,
    connect_retry_deadline: Duration,
    connected: Mutex<Option<Arc<Connected>>>,
}

impl KataAgent {
    pub fn new(transport: Transport, long_live: bool) -> Self {
        Self {
            transport,
            long_live,
            next_id: AtomicU64::new(1),
            max_chunk_size: crate::DEFAULT_MAX_CHUNK_SIZE,
            connect_retry_deadline: Duration::from_secs(30),
            connected: Mutex::new(None),
        }
    }

    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_connect_retry_deadline(mut self, deadline: Duration) -> Self {
        self.connect_retry_deadline = deadline;
        self
    }

    /// Dials the transport, retrying transient connect errors until
    /// `connect_retry_deadline` elapses (§4.1, §7).
    async fn dial(&self) -> Result<Arc<Connected>, AgentError> {
        let deadline = self.connect_retry_deadline;
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter);

        let transport = self.transport.clone();
        let conn = tokio::time::timeout(
            deadline,
            Retry::spawn(strategy, move || {
                let transport = transport.clone();
                async move { transport.connect().await }
            }),
        )
        .await
        .map_err(|_| AgentError::Timeout)??;

        Ok(spawn_connection(conn))
    }

    async fn connection(&self) -> Result<Arc<Connected>, AgentError> {
        if self.long_live {
            let mut guard = self.connected.lock().await;
            if let Some(c) = guard.as_ref() {
                return Ok(c.clone());
            }
            let c = self.dial().await?;
            *guard = Some(c.clone());
            Ok(c)
        } else {
            self.dial().await
        }
    }

    async fn call(
        &self,
        ctx: CallContext,
        request: AgentRequest,
    ) -> Result<AgentResponse, AgentError> {
        let connected = self.connection().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        connected.pending.lock().await.insert(id, tx);

        let payload = protocol::encode(&request)?;
        {
            let mut writer = connected.writer.lock().await;
            if let Err(e) = protocol::send_frame(&mut *writer, id, &payload).await {
                connected.pending.lock().await.remove(&id);
                return Err(e.into());
            }
        }

        let wait = rx;
        let response = match ctx.timeout {
            Some(d) => match tokio::time::timeout(d, wait).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(_)) => return Err(AgentError::Cancelled),
                Err(_) => {
                    // §5: cancelling closes the pending channel; the guest
                    // effect may still complete (at-least-once semantics).
                    connected.pending.lock().await.remove(&id);
                    return Err(AgentError::Timeout);
                }
            },
            None => wait.await.map_err(|_| AgentError::Cancelled)?,
        };

        match response {
            AgentResponse::Error(kind, message) => Err(AgentError::Guest { kind, message }),
            other => Ok(other),
        }
    }
}

fn spawn_connection(conn: Conn) -> Arc<Connected> {
    let (read_half, write_half) = conn.split();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let reader_pending = pending.clone();
    let reader_task = tokio::spawn(reader_loop(read_half, reader_pending));
    Arc::new(Connected {
        writer: Mutex::new(Box::new(write_half)),
        pending,
        reader_task,
    })
}

async fn reader_loop<R: AsyncRead + Unpin>(mut reader: R, pending: Pending) {
    loop {
        let frame = match protocol::receive_frame(&mut reader).await {
            Ok(f) => f,
            Err(_) => break,
        };
        let response: AgentResponse = match protocol::decode(&frame.payload) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if let Some(tx) = pending.lock().await.remove(&frame.request_id) {
            let _ = tx.send(response);
        }
    }
    // Connection died: wake every still-pending caller with a guest error so
    // they don't hang forever (§7 "persistent errors propagate").
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(AgentResponse::Error(
            GuestErrorKind::Internal,
            "agent transport closed".to_string(),
        ));
    }
}

fn expect_ack(resp: AgentResponse) -> Result<(), AgentError> {
    match resp {
        AgentResponse::Ack | AgentResponse::Check => Ok(()),
        _ => Err(AgentError::UnexpectedResponse),
    }
}

#[async_trait]
impl crate::Agent for KataAgent {
    async fn connect(&self, _ctx: CallContext) -> Result<(), AgentError> {
        self.connection().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        *self.connected.lock().await = None;
        Ok(())
    }

    async fn check(&self, ctx: CallContext) -> Result<(), AgentError> {
        expect_ack(self.call(ctx, AgentRequest::Check).await?)
    }

    async fn create_sandbox(
        &self,
        ctx: CallContext,
        sandbox_id: &str,
        hostname: &str,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::CreateSandbox {
                    sandbox_id: sandbox_id.to_string(),
                    hostname: hostname.to_string(),
                },
            )
            .await?,
        )
    }

    async fn start_sandbox(&self, ctx: CallContext) -> Result<(), AgentError> {
        expect_ack(self.call(ctx, AgentRequest::StartSandbox).await?)
    }

    async fn stop_sandbox(&self, ctx: CallContext) -> Result<(), AgentError> {
        expect_ack(self.call(ctx, AgentRequest::StopSandbox).await?)
    }

    async fn create_container(
        &self,
        ctx: CallContext,
        container_id: &str,
        spec_json: &str,
        devices: Vec<DeviceSpec>,
        storages: Vec<StorageSpec>,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::CreateContainer {
                    container_id: container_id.to_string(),
                    spec_json: spec_json.to_string(),
                    devices,
                    storages,
                },
            )
            .await?,
        )
    }

    async fn start_container(
        &self,
        ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::StartContainer {
                    container_id: container_id.to_string(),
                },
            )
            .await?,
        )
    }

    async fn stop_container(&self, ctx: CallContext, container_id: &str) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::StopContainer {
                    container_id: container_id.to_string(),
                },
            )
            .await?,
        )
    }

    async fn pause_container(
        &self,
        ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::PauseContainer {
                    container_id: container_id.to_string(),
                },
            )
            .await?,
        )
    }

    async fn resume_container(
        &self,
        ctx: CallContext,
        container_id: &str,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::ResumeContainer {
                    container_id: container_id.to_string(),
                },
            )
            .await?,
        )
    }

    async fn exec(
        &self,
        ctx: CallContext,
        container_id: &str,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: &str,
        terminal: bool,
    ) -> Result<Process, AgentError> {
        match self
            .call(
                ctx,
                AgentRequest::Exec {
                    container_id: container_id.to_string(),
                    argv,
                    env,
                    cwd: cwd.to_string(),
                    terminal,
                },
            )
            .await?
        {
            AgentResponse::Process(p) => Ok(p),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn wait_process(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
    ) -> Result<i32, AgentError> {
        match self
            .call(
                ctx,
                AgentRequest::WaitProcess {
                    container_id: container_id.to_string(),
                    process_id: process_id.to_string(),
                },
            )
            .await?
        {
            AgentResponse::ExitCode(code) => Ok(code),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn signal_process(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::SignalProcess {
                    container_id: container_id.to_string(),
                    process_id: process_id.to_string(),
                    signal,
                    all,
                },
            )
            .await?,
        )
    }

    async fn winsize_process(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::WinsizeProcess {
                    container_id: container_id.to_string(),
                    process_id: process_id.to_string(),
                    rows,
                    cols,
                },
            )
            .await?,
        )
    }

    async fn write_stdin(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        data: &[u8],
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::WriteStdin {
                    container_id: container_id.to_string(),
                    process_id: process_id.to_string(),
                    data: data.to_vec(),
                },
            )
            .await?,
        )
    }

    async fn close_stdin(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::CloseStdin {
                    container_id: container_id.to_string(),
                    process_id: process_id.to_string(),
                },
            )
            .await?,
        )
    }

    async fn read_stdout(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        max_bytes: u32,
    ) -> Result<Vec<u8>, AgentError> {
        match self
            .call(
                ctx,
                AgentRequest::ReadStdout {
                    container_id: container_id.to_string(),
                    process_id: process_id.to_string(),
                    max_bytes: max_bytes.min(self.max_chunk_size as u32),
                },
            )
            .await?
        {
            AgentResponse::Bytes(b) => Ok(b),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn read_stderr(
        &self,
        ctx: CallContext,
        container_id: &str,
        process_id: &str,
        max_bytes: u32,
    ) -> Result<Vec<u8>, AgentError> {
        match self
            .call(
                ctx,
                AgentRequest::ReadStderr {
                    container_id: container_id.to_string(),
                    process_id: process_id.to_string(),
                    max_bytes: max_bytes.min(self.max_chunk_size as u32),
                },
            )
            .await?
        {
            AgentResponse::Bytes(b) => Ok(b),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn update_container(
        &self,
        ctx: CallContext,
        container_id: &str,
        resources: ResourceUpdate,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::UpdateContainer {
                    container_id: container_id.to_string(),
                    resources,
                },
            )
            .await?,
        )
    }

    async fn online_cpu_mem(
        &self,
        ctx: CallContext,
        cpus: u32,
        cpu_only: bool,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(ctx, AgentRequest::OnlineCpuMem { cpus, cpu_only })
                .await?,
        )
    }

    async fn mem_hotplug_by_probe(
        &self,
        ctx: CallContext,
        addrs: Vec<u64>,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(ctx, AgentRequest::MemHotplugByProbe { addrs })
                .await?,
        )
    }

    async fn update_interface(
        &self,
        ctx: CallContext,
        interface: Interface,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(ctx, AgentRequest::UpdateInterface { interface })
                .await?,
        )
    }

    async fn list_interfaces(&self, ctx: CallContext) -> Result<Vec<Interface>, AgentError> {
        match self.call(ctx, AgentRequest::ListInterfaces).await? {
            AgentResponse::Interfaces(v) => Ok(v),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn update_routes(&self, ctx: CallContext, routes: Vec<Route>) -> Result<(), AgentError> {
        expect_ack(self.call(ctx, AgentRequest::UpdateRoutes { routes }).await?)
    }

    async fn list_routes(&self, ctx: CallContext) -> Result<Vec<Route>, AgentError> {
        match self.call(ctx, AgentRequest::ListRoutes).await? {
            AgentResponse::Routes(v) => Ok(v),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn add_arp_neighbors(
        &self,
        ctx: CallContext,
        neighbors: Vec<Neighbor>,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(ctx, AgentRequest::AddArpNeighbors { neighbors })
                .await?,
        )
    }

    async fn update_ephemeral_mounts(
        &self,
        ctx: CallContext,
        mounts: Vec<EphemeralMount>,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(ctx, AgentRequest::UpdateEphemeralMounts { mounts })
                .await?,
        )
    }

    async fn reseed_rng(&self, ctx: CallContext, data: Vec<u8>) -> Result<(), AgentError> {
        expect_ack(self.call(ctx, AgentRequest::ReseedRng { data }).await?)
    }

    async fn set_guest_datetime(
        &self,
        ctx: CallContext,
        seconds: i64,
        nanoseconds: i64,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::SetGuestDateTime {
                    seconds,
                    nanoseconds,
                },
            )
            .await?,
        )
    }

    async fn copy_file(
        &self,
        ctx: CallContext,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), AgentError> {
        // Caller-facing chunking contract (§4.1): large payloads should be
        // pre-sliced with `chunk_for_copy`; this call sends one slice.
        expect_ack(
            self.call(
                ctx,
                AgentRequest::CopyFile {
                    path: path.to_string(),
                    offset,
                    data: data.to_vec(),
                },
            )
            .await?,
        )
    }

    async fn get_guest_details(&self, ctx: CallContext) -> Result<GuestDetails, AgentError> {
        match self.call(ctx, AgentRequest::GetGuestDetails).await? {
            AgentResponse::GuestDetails(d) => Ok(d),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn get_oom_event(
        &self,
        ctx: CallContext,
    ) -> Result<shared::rpc::OomEvent, AgentError> {
        match self.call(ctx, AgentRequest::GetOomEvent).await? {
            AgentResponse::OomEvent(e) => Ok(e),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn get_agent_metrics(&self, ctx: CallContext) -> Result<String, AgentError> {
        match self.call(ctx, AgentRequest::GetAgentMetrics).await? {
            AgentResponse::Metrics(m) => Ok(m),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn get_ip_tables(&self, ctx: CallContext, is_ipv6: bool) -> Result<Vec<u8>, AgentError> {
        match self.call(ctx, AgentRequest::GetIpTables { is_ipv6 }).await? {
            AgentResponse::IpTables(d) => Ok(d),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn set_ip_tables(
        &self,
        ctx: CallContext,
        is_ipv6: bool,
        data: Vec<u8>,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(ctx, AgentRequest::SetIpTables { is_ipv6, data })
                .await?,
        )
    }

    async fn set_policy(&self, ctx: CallContext, policy: &str) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::SetPolicy {
                    policy: policy.to_string(),
                },
            )
            .await?,
        )
    }

    async fn resize_guest_volume(
        &self,
        ctx: CallContext,
        guest_path: &str,
        size_bytes: u64,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::ResizeGuestVolume {
                    guest_path: guest_path.to_string(),
                    size_bytes,
                },
            )
            .await?,
        )
    }

    async fn get_guest_volume_stats(
        &self,
        ctx: CallContext,
        guest_path: &str,
    ) -> Result<(u64, u64), AgentError> {
        match self
            .call(
                ctx,
                AgentRequest::GetGuestVolumeStats {
                    guest_path: guest_path.to_string(),
                },
            )
            .await?
        {
            AgentResponse::VolumeStats {
                capacity_bytes,
                used_bytes,
            } => Ok((capacity_bytes, used_bytes)),
            _ => Err(AgentError::UnexpectedResponse),
        }
    }

    async fn add_swap(
        &self,
        ctx: CallContext,
        path: &str,
        size_bytes: u64,
    ) -> Result<(), AgentError> {
        expect_ack(
            self.call(
                ctx,
                AgentRequest::AddSwap {
                    path: path.to_string(),
                    size_bytes,
                },
            )
            .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_for_copy_respects_client_max_chunk_size() {
        let data = vec![7u8; 10];
        let chunks = chunk_for_copy(&data, 4);
        assert_eq!(chunks.len(), 3);
    }
}
