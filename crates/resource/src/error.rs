/// §7: `NetworkError`, plus the mount-classification failure modes of §4.7.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("unsupported bridging strategy {0:?} for endpoint kind {1:?}")]
    UnsupportedBridging(crate::network::BridgingStrategy, crate::network::EndpointKind),
    #[error("capability does not allow hot-{0}")]
    HotplugUnsupported(&'static str),
    #[error("endpoint not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Device(#[from] hypervisor::error::DeviceError),
    #[error(transparent)]
    Hypervisor(#[from] hypervisor::error::HypervisorError),
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("subpath escapes its root via '..': {0}")]
    PathEscape(String),
    #[error("fd link {0} does not resolve to an empty-dir mount")]
    NotEmptyDir(String),
    #[error("io error reading {0}: {1}")]
    Io(String, std::io::Error),
}
