//! Sandbox Engine (F) and Container Lifecycle (G): the create/start/stop/
//! pause/resume/delete flows of §4.5, composed from `resource::ResourceManager`
//! plus `hypervisor`/`agent` backends injected by the caller.
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod oci;
pub mod rollback;
pub mod state;

pub use config::{ContainerSpec, SandboxConfig, VfioDeviceRequest, VfioMode};
pub use container::{Container, ContainerState};
pub use engine::SandboxEngine;
pub use error::SandboxError;
pub use state::SandboxState;
