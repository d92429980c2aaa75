//! Persistence layer (H): versioned on-disk snapshots enabling crash-safe
//! restart, grounded on `persist::sandbox_persist::Persist` as used by
//! `other_examples/09dc8c96_..._manager_inner.rs.rs`'s
//! `impl Persist for ResourceManagerInner`.
pub mod error;
pub mod state;
pub mod store;

pub use error::PersistError;
pub use state::{ContainerState, NetworkState, PersistedSandboxState, CURRENT_PERSIST_VERSION};
pub use store::PersistStore;

use async_trait::async_trait;

/// A component that can snapshot itself into part of `PersistedSandboxState`
/// and be rebuilt from that snapshot plus whatever runtime handles (agent,
/// hypervisor, device manager) it cannot serialize.
#[async_trait]
pub trait Persist: Sized {
    type State;
    type ConstructorArgs;

    async fn save(&self) -> Result<Self::State, PersistError>;
    async fn restore(args: Self::ConstructorArgs, state: Self::State) -> Result<Self, PersistError>;
}
