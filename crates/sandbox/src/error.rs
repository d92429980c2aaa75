/// §7 error kinds, aggregated at the Sandbox-engine boundary. Collaborator
/// crates keep their own `thiserror` enums; this one composes them the way
/// the grounding `manager_inner.rs.rs` leans on `anyhow::Context` instead,
/// but a typed enum here lets callers match on `NotFound`/`InvalidState`
/// without downcasting.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid state: current={current}, requested={requested}")]
    InvalidState {
        current: &'static str,
        requested: &'static str,
    },
    #[error(transparent)]
    Hypervisor(#[from] hypervisor::error::HypervisorError),
    #[error(transparent)]
    Agent(#[from] agent::AgentError),
    #[error(transparent)]
    Network(#[from] resource::NetworkError),
    #[error(transparent)]
    Mount(#[from] resource::MountError),
    #[error(transparent)]
    Persist(#[from] persist::PersistError),
    #[error("operation timed out")]
    Timeout,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("operation cancelled")]
    Cancelled,
}
