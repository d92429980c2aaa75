/// §7 `HypervisorError` / `DeviceError{bus_full|driver_mismatch|missing_host_path}`.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid state: current={current}, requested={requested}")]
    InvalidState {
        current: &'static str,
        requested: &'static str,
    },
    #[error("vmm control error: {0}")]
    Vmm(String),
    #[error("operation timed out")]
    Timeout,
    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no free bridge slot available")]
    BusFull,
    #[error("driver mismatch for device {0}")]
    DriverMismatch(String),
    #[error("missing host path: {0}")]
    MissingHostPath(String),
    #[error("device not found: {0}")]
    NotFound(String),
}
