use thiserror::Error;

/// Errors the wire codec can raise. Grounded on the `faster-stun` crate's
/// crate-local `Error` enum (`examples/mycrl-turn-rs/crates/stun`): a flat
/// enum over the handful of ways a fixed-layout frame can fail to parse.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header magic mismatch")]
    BadMagic,
    #[error("unsupported protocol version 0x{0:04x}")]
    UnsupportedVersion(u16),
    #[error("truncated frame: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: u32, max: usize },
    #[error("invalid RTP datagram")]
    InvalidRtp,
}
