//! §4.4 Network Endpoints (D): one virtual NIC from the host netns into the
//! VM per supported kind, plus interface/route/neighbor sync to the agent.
use crate::error::NetworkError;
use firecracker_sdk::dto::{RateLimiter, TokenBucket};
use hypervisor::device_manager::Device;
use hypervisor::Capabilities;
use shared::rpc::{AddressFamily, IpAddress, Interface as AgentInterface, Neighbor, Route};

/// The concrete backing technology for a network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Veth,
    Tap,
    Macvlan,
    Macvtap,
    IpVlan,
    VhostUser,
    Physical,
    TunTap,
    Vfio,
}

/// Host-side wiring strategy for veth-like endpoints (§4.4 "Bridging
/// strategies"). TC-filter is the only mode compatible with ipvlan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgingStrategy {
    Default,
    TcFilter,
    Macvtap,
    None,
}

impl BridgingStrategy {
    pub fn compatible_with(self, kind: EndpointKind) -> bool {
        match kind {
            EndpointKind::IpVlan => self == BridgingStrategy::TcFilter,
            _ => true,
        }
    }
}

/// Per-endpoint bandwidth cap (§4.4 "Rate limiting"), reusing the teacher's
/// Firecracker token-bucket DTOs as the abstract rate-limiter shape.
#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    pub rx_max_bps: Option<u64>,
    pub tx_max_bps: Option<u64>,
    pub one_time_burst: Option<u64>,
}

impl RateLimit {
    /// Converts the per-second byte caps into the VMM's per-direction
    /// token-bucket shape, only when enforcement is delegated to a
    /// rate-limiter-builtin backend (§4.4: "otherwise enforced via TC token
    /// buckets in the host netns"). Returns `(rx, tx)`.
    pub fn to_firecracker_rate_limiters(
        &self,
        bucket_refill_ms: i64,
    ) -> (Option<RateLimiter>, Option<RateLimiter>) {
        let bucket = |bps: u64| RateLimiter {
            bandwidth: Some(TokenBucket {
                size: bps as i64,
                one_time_burst: self.one_time_burst.map(|b| b as i64),
                refill_time: bucket_refill_ms,
            }),
            ops: None,
        };
        (self.rx_max_bps.map(bucket), self.tx_max_bps.map(bucket))
    }
}

#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub name: String,
    pub hardware_addr: String,
    pub addresses: Vec<IpAddress>,
    pub mtu: u32,
    pub kind: EndpointKind,
}

/// Persisted image of an endpoint, produced by `save()` and consumed by
/// `load()` on restore (§4.6 "rebuild Network endpoints by kind").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointState {
    pub name: String,
    pub hardware_addr: String,
    pub mtu: u32,
    pub pci_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkEndpoint {
    pub name: String,
    pub hardware_addr: String,
    pub mtu: u32,
    pub kind: EndpointKind,
    pub bridging: BridgingStrategy,
    pub rate_limit: RateLimit,
    pub addresses: Vec<IpAddress>,
    pci_path: Option<String>,
    attached: bool,
}

impl NetworkEndpoint {
    pub fn new(
        name: impl Into<String>,
        hardware_addr: impl Into<String>,
        kind: EndpointKind,
        bridging: BridgingStrategy,
    ) -> Result<Self, NetworkError> {
        if !bridging.compatible_with(kind) {
            return Err(NetworkError::UnsupportedBridging(bridging, kind));
        }
        Ok(Self {
            name: name.into(),
            hardware_addr: hardware_addr.into(),
            mtu: 1500,
            kind,
            bridging,
            rate_limit: RateLimit::default(),
            addresses: Vec::new(),
            pci_path: None,
            attached: false,
        })
    }

    pub fn properties(&self) -> NetworkInfo {
        NetworkInfo {
            name: self.name.clone(),
            hardware_addr: self.hardware_addr.clone(),
            addresses: self.addresses.clone(),
            mtu: self.mtu,
            kind: self.kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hardware_addr(&self) -> &str {
        &self.hardware_addr
    }

    pub fn pci_path(&self) -> Option<&str> {
        self.pci_path.as_deref()
    }

    /// Builds the device-manager record for this endpoint (§4.4 "Rate
    /// limiting"): carries the hardware address and, when configured, the
    /// per-direction token buckets through to the VMM.
    pub fn to_device(&self, bucket_refill_ms: i64) -> Device {
        let (rx_rate_limiter, tx_rate_limiter) =
            self.rate_limit.to_firecracker_rate_limiters(bucket_refill_ms);
        Device::NetworkEndpoint {
            name: self.name.clone(),
            mac: Some(self.hardware_addr.clone()),
            rx_rate_limiter,
            tx_rate_limiter,
        }
    }

    /// Marks the endpoint wired into the VM. Callers (`ResourceManager`)
    /// are responsible for the actual `Hypervisor::add_device` call before
    /// flipping this bookkeeping flag.
    pub fn mark_attached(&mut self) {
        self.attached = true;
    }

    pub fn detach(&mut self, _netns_created: bool, _netns_path: &str) -> Result<(), NetworkError> {
        self.attached = false;
        Ok(())
    }

    /// Validates the capability bit up front (§9 Open Question: never rely
    /// on a backend-specific silent no-op) and records the PCI path the
    /// caller's `Hypervisor::hotplug_add_device` call returned.
    pub fn mark_hot_attached(&mut self, caps: Capabilities) -> Result<(), NetworkError> {
        if !caps.net_device_hotplug {
            return Err(NetworkError::HotplugUnsupported("attach"));
        }
        self.attached = true;
        self.pci_path = Some(format!("pci/{}", self.name));
        Ok(())
    }

    pub fn hot_detach(&mut self, caps: Capabilities) -> Result<(), NetworkError> {
        if !caps.net_device_hotplug {
            return Err(NetworkError::HotplugUnsupported("detach"));
        }
        self.attached = false;
        self.pci_path = None;
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn save(&self) -> EndpointState {
        EndpointState {
            name: self.name.clone(),
            hardware_addr: self.hardware_addr.clone(),
            mtu: self.mtu,
            pci_path: self.pci_path.clone(),
        }
    }

    pub fn load(kind: EndpointKind, state: EndpointState) -> Self {
        Self {
            name: state.name,
            hardware_addr: state.hardware_addr,
            mtu: state.mtu,
            kind,
            bridging: BridgingStrategy::Default,
            rate_limit: RateLimit::default(),
            addresses: Vec::new(),
            pci_path: state.pci_path,
            attached: true,
        }
    }

    pub fn to_agent_interface(&self) -> AgentInterface {
        AgentInterface {
            name: self.name.clone(),
            hw_addr: self.hardware_addr.clone(),
            mtu: self.mtu,
            ip_addresses: self.addresses.clone(),
            raw_flags: 0,
        }
    }
}

/// §4.4 "On Sandbox start, scan the netns... push them to the guest".
/// Splits interfaces/routes/neighbors into the shape the agent RPCs expect;
/// pushing them over the wire is the caller's job (the Sandbox engine holds
/// the `Arc<dyn Agent>`, this module only assembles the payloads).
pub fn collect_sync_payload(
    endpoints: &[NetworkEndpoint],
    routes: Vec<Route>,
    neighbors: Vec<Neighbor>,
) -> (Vec<AgentInterface>, Vec<Route>, Vec<Neighbor>) {
    let interfaces = endpoints.iter().map(NetworkEndpoint::to_agent_interface).collect();
    (interfaces, routes, neighbors)
}

pub fn v4(address: impl Into<String>, prefix_len: u8) -> IpAddress {
    IpAddress {
        family: AddressFamily::V4,
        address: address.into(),
        prefix_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tc_filter_is_the_only_ipvlan_compatible_strategy() {
        assert!(
            NetworkEndpoint::new("ipvl0", "aa:bb", EndpointKind::IpVlan, BridgingStrategy::TcFilter)
                .is_ok()
        );
        assert!(
            NetworkEndpoint::new("ipvl0", "aa:bb", EndpointKind::IpVlan, BridgingStrategy::Default)
                .is_err()
        );
    }

    #[test]
    fn hot_attach_requires_capability() {
        let mut ep =
            NetworkEndpoint::new("eth0", "aa:bb", EndpointKind::Tap, BridgingStrategy::Default)
                .unwrap();
        assert!(ep.mark_hot_attached(Capabilities::none()).is_err());
        assert!(ep.mark_hot_attached(Capabilities::all()).is_ok());
        assert!(ep.is_attached());
    }

    #[test]
    fn save_and_load_roundtrips_identity() {
        let mut ep =
            NetworkEndpoint::new("eth0", "aa:bb:cc", EndpointKind::Veth, BridgingStrategy::Default)
                .unwrap();
        ep.mark_attached();
        let state = ep.save();
        let restored = NetworkEndpoint::load(EndpointKind::Veth, state);
        assert_eq!(restored.name(), "eth0");
        assert_eq!(restored.hardware_addr(), "aa:bb:cc");
    }

    #[test]
    fn to_device_carries_mac_and_tx_rate_limit() {
        let mut ep =
            NetworkEndpoint::new("eth0", "aa:bb:cc", EndpointKind::Tap, BridgingStrategy::Default)
                .unwrap();
        ep.rate_limit.tx_max_bps = Some(1_000_000);
        ep.rate_limit.one_time_burst = Some(4096);
        match ep.to_device(1000) {
            Device::NetworkEndpoint {
                name,
                mac,
                rx_rate_limiter,
                tx_rate_limiter,
            } => {
                assert_eq!(name, "eth0");
                assert_eq!(mac.as_deref(), Some("aa:bb:cc"));
                assert!(rx_rate_limiter.is_none());
                let tx = tx_rate_limiter.unwrap();
                let bandwidth = tx.bandwidth.unwrap();
                assert_eq!(bandwidth.size, 1_000_000);
                assert_eq!(bandwidth.one_time_burst, Some(4096));
            }
            other => panic!("expected a NetworkEndpoint device, got {other:?}"),
        }
    }
}
