//! Wire-level framing and RPC message schema shared between the host-side
//! agent client (`crates/agent`) and its transports.
pub mod protocol;
pub mod rpc;
