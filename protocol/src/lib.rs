//! Wire formats for the LAN voice conferencing relay.
//!
//! Three protocols share this crate:
//! - UDP broadcast discovery (server advertisement / probe-response)
//! - TCP session control, framed by a common 20-byte header
//! - RTP-like UDP audio transport, a distinct 16-byte header
//!
//! Every structure here is encoded explicitly, field by field, in little-
//! endian order. Nothing is read or written as a memory image of a packed
//! struct: see DESIGN.md for why.

mod error;
pub mod header;
pub mod discovery;
pub mod control;
pub mod rtp;

pub use error::ProtocolError;

/// Maximum payload a single TCP control frame may carry (§4.3).
pub const MAX_CONTROL_PAYLOAD: usize = 4096;

/// Maximum RTP payload (§4.3, §6).
pub const MAX_RTP_PAYLOAD: usize = 512;

/// Fixed display-name field width used throughout the control and discovery
/// protocols (§3, §6).
pub const NAME_LEN: usize = 32;

/// Fills `dst` with the NUL-padded UTF-8 bytes of `s`, truncating to fit.
pub(crate) fn write_fixed_str(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in &mut dst[n..] {
        *b = 0;
    }
}

/// Reads a NUL-padded fixed-width field back into a `String`, lossily.
pub(crate) fn read_fixed_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}
