//! The 20-byte header common to every discovery and TCP control frame (§4.1).

use byteorder::{ByteOrder, LittleEndian};

use crate::ProtocolError;

/// `"SVPC"` read as a little-endian u32 — matches spec.md §4.1 exactly.
pub const MAGIC: u32 = 0x5356_5043;

/// Current wire version.
pub const VERSION: u16 = 0x0200;

pub const HEADER_LEN: usize = 20;

/// Discovery message types (§6).
pub const MSG_DISCOVERY_REQUEST: u16 = 0x0001;
pub const MSG_DISCOVERY_RESPONSE: u16 = 0x0002;

/// Control message types (§6).
pub const MSG_HELLO: u16 = 0x0101;
pub const MSG_HELLO_ACK: u16 = 0x0102;
pub const MSG_JOIN_SESSION: u16 = 0x0103;
pub const MSG_LEAVE_SESSION: u16 = 0x0104;
pub const MSG_HEARTBEAT: u16 = 0x0105;

/// §9 REDESIGN FLAGS: the source numerically collides `JOIN_ACK` with
/// `LEAVE_SESSION` (both would be 0x0104). We break that collision and give
/// `JOIN_ACK` the documented, distinct type the spec proposes.
pub const MSG_JOIN_ACK: u16 = 0x0106;

pub const MSG_AUDIO_START: u16 = 0x0201;
pub const MSG_AUDIO_STOP: u16 = 0x0202;
pub const MSG_AUDIO_MUTE: u16 = 0x0203;
pub const MSG_AUDIO_UNMUTE: u16 = 0x0204;

pub const MSG_PEER_LIST: u16 = 0x0301;
pub const MSG_PEER_JOIN: u16 = 0x0302;
pub const MSG_PEER_LEAVE: u16 = 0x0303;
pub const MSG_PEER_STATE: u16 = 0x0304;

/// Common header prefixing every discovery/control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u16,
    pub payload_length: u32,
    /// Reserved per §4.1; carried through unexamined today.
    pub sequence: u32,
    pub local_time_ms: u32,
}

impl Header {
    pub fn new(msg_type: u16, payload_length: u32) -> Self {
        Self {
            msg_type,
            payload_length,
            sequence: 0,
            local_time_ms: 0,
        }
    }

    pub fn encode(&self, buf: &mut [u8; HEADER_LEN]) {
        LittleEndian::write_u32(&mut buf[0..4], MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], VERSION);
        LittleEndian::write_u16(&mut buf[6..8], self.msg_type);
        LittleEndian::write_u32(&mut buf[8..12], self.payload_length);
        LittleEndian::write_u32(&mut buf[12..16], self.sequence);
        LittleEndian::write_u32(&mut buf[16..20], self.local_time_ms);
    }

    /// Parses a header. Per §4.1, a magic mismatch is the only
    /// unrecoverable validation failure at this layer — callers drain and
    /// resynchronize on error rather than trying to recover in place.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                need: HEADER_LEN,
                got: buf.len(),
            });
        }
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        let version = LittleEndian::read_u16(&buf[4..6]);
        if version != VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(Self {
            msg_type: LittleEndian::read_u16(&buf[6..8]),
            payload_length: LittleEndian::read_u32(&buf[8..12]),
            sequence: LittleEndian::read_u32(&buf[12..16]),
            local_time_ms: LittleEndian::read_u32(&buf[16..20]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = Header {
            msg_type: MSG_HELLO,
            payload_length: 40,
            sequence: 7,
            local_time_ms: 123_456,
        };
        let mut buf = [0u8; HEADER_LEN];
        h.encode(&mut buf);
        let parsed = Header::decode(&buf).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn bad_magic_rejected() {
        let buf = [0u8; HEADER_LEN];
        assert!(matches!(Header::decode(&buf), Err(ProtocolError::BadMagic)));
    }

    #[test]
    fn join_ack_type_is_distinct_from_leave_session() {
        assert_ne!(MSG_JOIN_ACK, MSG_LEAVE_SESSION);
    }
}
