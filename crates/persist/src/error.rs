/// §7 `PersistError{io|version|corrupt}`.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persistence io error on {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("unsupported persist version {found}, expected <= {supported}")]
    Version { found: u32, supported: u32 },
    #[error("corrupt persisted state at {0}: {1}")]
    Corrupt(String, serde_json::Error),
}
