use shared::rpc::GuestErrorKind;

/// §7: `AgentError{transport|protocol|guest}`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("guest error ({kind:?}): {message}")]
    Guest {
        kind: GuestErrorKind,
        message: String,
    },
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("unexpected response variant for this request")]
    UnexpectedResponse,
}

impl AgentError {
    /// §4.1 "Transient connect errors are retried until a caller-supplied
    /// deadline elapses": only transport-level failures are retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AgentError::Transport(_) | AgentError::Timeout)
    }
}

impl From<shared::protocol::FrameError> for AgentError {
    fn from(e: shared::protocol::FrameError) -> Self {
        match e {
            shared::protocol::FrameError::Io(e) => AgentError::Transport(e.to_string()),
            other => AgentError::Protocol(other.to_string()),
        }
    }
}
