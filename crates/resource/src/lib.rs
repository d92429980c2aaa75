//! Resource layer (C/D/I): device manager composition, network endpoints
//! and mount/storage classification, sitting between the Sandbox engine and
//! the Hypervisor/Agent backends.
pub mod error;
pub mod manager;
pub mod mount;
pub mod network;

pub use error::{MountError, NetworkError};
pub use manager::ResourceManager;
pub use network::{BridgingStrategy, EndpointKind, NetworkEndpoint};
