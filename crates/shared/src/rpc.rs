//! Request/response schema for the agent RPC protocol (§4.1, §6 "Agent wire
//! protocol"). Every request is one self-describing record; every
//! response carries either a typed result or a [`GuestErrorKind`].
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub request_id: u64,
    pub body: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Process {
    pub token: String,
    pub pid: i32,
    pub start_time_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUpdate {
    pub cpu_period_us: Option<u64>,
    pub cpu_quota_us: Option<i64>,
    pub cpu_shares: Option<u64>,
    pub memory_limit_bytes: Option<i64>,
    pub hugepage_limits_bytes: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub family: AddressFamily,
    pub address: String,
    pub prefix_len: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub hw_addr: String,
    pub mtu: u32,
    pub ip_addresses: Vec<IpAddress>,
    pub raw_flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub dest: String,
    pub gateway: String,
    pub device: String,
    pub source: String,
    pub scope: u32,
    pub family: AddressFamily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub device: String,
    pub lladdr: String,
    pub ip_address: IpAddress,
    pub state: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralMount {
    pub source: String,
    pub destination: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestDetails {
    pub kernel_release: String,
    pub agent_version: String,
    pub init_daemon_pid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OomEvent {
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
    Interrupt,
    Hangup,
    UserDefined1,
    UserDefined2,
}

/// All requests the Sandbox engine may send to the in-guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentRequest {
    Check,
    CreateSandbox {
        sandbox_id: String,
        hostname: String,
    },
    StartSandbox,
    StopSandbox,
    CreateContainer {
        container_id: String,
        spec_json: String,
        devices: Vec<DeviceSpec>,
        storages: Vec<StorageSpec>,
    },
    StartContainer {
        container_id: String,
    },
    StopContainer {
        container_id: String,
    },
    PauseContainer {
        container_id: String,
    },
    ResumeContainer {
        container_id: String,
    },
    Exec {
        container_id: String,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
        terminal: bool,
    },
    WaitProcess {
        container_id: String,
        process_id: String,
    },
    SignalProcess {
        container_id: String,
        process_id: String,
        signal: Signal,
        all: bool,
    },
    WinsizeProcess {
        container_id: String,
        process_id: String,
        rows: u16,
        cols: u16,
    },
    WriteStdin {
        container_id: String,
        process_id: String,
        data: Vec<u8>,
    },
    CloseStdin {
        container_id: String,
        process_id: String,
    },
    ReadStdout {
        container_id: String,
        process_id: String,
        max_bytes: u32,
    },
    ReadStderr {
        container_id: String,
        process_id: String,
        max_bytes: u32,
    },
    UpdateContainer {
        container_id: String,
        resources: ResourceUpdate,
    },
    OnlineCpuMem {
        cpus: u32,
        cpu_only: bool,
    },
    MemHotplugByProbe {
        addrs: Vec<u64>,
    },
    UpdateInterface {
        interface: Interface,
    },
    ListInterfaces,
    UpdateRoutes {
        routes: Vec<Route>,
    },
    ListRoutes,
    AddArpNeighbors {
        neighbors: Vec<Neighbor>,
    },
    UpdateEphemeralMounts {
        mounts: Vec<EphemeralMount>,
    },
    ReseedRng {
        data: Vec<u8>,
    },
    SetGuestDateTime {
        seconds: i64,
        nanoseconds: i64,
    },
    CopyFile {
        path: String,
        offset: u64,
        data: Vec<u8>,
    },
    GetGuestDetails,
    GetOomEvent,
    GetAgentMetrics,
    GetIpTables {
        is_ipv6: bool,
    },
    SetIpTables {
        is_ipv6: bool,
        data: Vec<u8>,
    },
    SetPolicy {
        policy: String,
    },
    ResizeGuestVolume {
        guest_path: String,
        size_bytes: u64,
    },
    GetGuestVolumeStats {
        guest_path: String,
    },
    AddSwap {
        path: String,
        size_bytes: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub container_path: String,
    pub vm_path: String,
    pub field_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSpec {
    pub source: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Guest-side error classification preserved across the transport boundary
/// (§7: "protocol-level errors surface as a typed error preserving the
/// guest's error kind").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum GuestErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Internal,
    Unimplemented,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentResponse {
    Ack,
    Check,
    Process(Process),
    ExitCode(i32),
    Bytes(Vec<u8>),
    Interfaces(Vec<Interface>),
    Routes(Vec<Route>),
    GuestDetails(GuestDetails),
    OomEvent(OomEvent),
    Metrics(String),
    IpTables(Vec<u8>),
    VolumeStats { capacity_bytes: u64, used_bytes: u64 },
    Error(GuestErrorKind, String),
}
