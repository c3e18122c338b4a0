use thiserror::Error;

/// Errors surfaced at the orchestrator entry points (§6, §7). Transient I/O,
/// peer-vanished, malformed-frame and resource-saturation conditions are
/// absorbed internally per §7 and never reach here — only configuration
/// errors bubble up to the operator surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("could not resolve address: {0}")]
    UnresolvableAddress(String),

    #[error("already running in {0} mode")]
    AlreadyRunning(&'static str),

    #[error("not connected")]
    NotConnected,

    #[error("not in a session")]
    NotInSession,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] lanvoice_protocol::ProtocolError),

    #[error("reachability check to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("server rejected join: result={0}")]
    JoinRejected(u32),
}
