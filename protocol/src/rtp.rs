//! RTP-like audio packet header (§3, §4.3, §6).
//!
//! Distinct from, and simpler than, the 20-byte control header: 16 bytes,
//! no trailing TLVs, carried one-per-datagram with no reassembly.

use byteorder::{ByteOrder, LittleEndian};

use crate::{ProtocolError, MAX_RTP_PAYLOAD};

pub const DEFAULT_AUDIO_PORT: u16 = 6000;

pub const RTP_VERSION: u8 = 2;

/// Payload types (§3).
pub const PT_RAW_PCM: u8 = 0;
pub const PT_OPUS: u8 = 111;

pub const HEADER_LEN: usize = 16;

/// Flag bits (§3, §6).
pub const FLAG_MARKER: u16 = 0x0001;
pub const FLAG_VAD_ACTIVE: u16 = 0x0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_length: u16,
    pub flags: u16,
}

impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            payload_type,
            sequence: 0,
            timestamp: 0,
            ssrc,
            payload_length: 0,
            flags: 0,
        }
    }

    pub fn marker(&self) -> bool {
        self.flags & FLAG_MARKER != 0
    }

    pub fn vad_active(&self) -> bool {
        self.flags & FLAG_VAD_ACTIVE != 0
    }

    fn encode(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = self.version;
        buf[1] = self.payload_type;
        LittleEndian::write_u16(&mut buf[2..4], self.sequence);
        LittleEndian::write_u32(&mut buf[4..8], self.timestamp);
        LittleEndian::write_u32(&mut buf[8..12], self.ssrc);
        LittleEndian::write_u16(&mut buf[12..14], self.payload_length);
        LittleEndian::write_u16(&mut buf[14..16], self.flags);
    }

    fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidRtp);
        }
        let version = buf[0];
        if version != RTP_VERSION {
            return Err(ProtocolError::InvalidRtp);
        }
        Ok(Self {
            version,
            payload_type: buf[1],
            sequence: LittleEndian::read_u16(&buf[2..4]),
            timestamp: LittleEndian::read_u32(&buf[4..8]),
            ssrc: LittleEndian::read_u32(&buf[8..12]),
            payload_length: LittleEndian::read_u16(&buf[12..14]),
            flags: LittleEndian::read_u16(&buf[14..16]),
        })
    }
}

/// A parsed RTP datagram: header plus the payload slice that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Packs header + payload into one datagram. `payload` must be at most
    /// [`MAX_RTP_PAYLOAD`] bytes (§4.3); longer payloads are truncated by
    /// the caller's responsibility, not silently dropped here — callers
    /// should never hand this a frame above the limit.
    pub fn encode(mut header: RtpHeader, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= MAX_RTP_PAYLOAD);
        header.payload_length = payload.len() as u16;
        let mut out = vec![0u8; HEADER_LEN + payload.len()];
        header.encode((&mut out[..HEADER_LEN]).try_into().unwrap());
        out[HEADER_LEN..].copy_from_slice(payload);
        out
    }

    /// Parses a received datagram. Per §4.3, any datagram shorter than the
    /// header or whose version field isn't 2 is rejected outright.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let header = RtpHeader::decode(datagram)?;
        let payload = datagram[HEADER_LEN..].to_vec();
        Ok(Self { header, payload })
    }
}

/// Signed 16-bit sequence distance: `a - b` wrapped into `[-32768, 32767)`
/// (§3 invariant). Used by the jitter core to order packets across the
/// 2^16 sequence wraparound.
pub fn seq_distance(a: u16, b: u16) -> i32 {
    (a as i32 - b as i32) as i16 as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_header_roundtrip() {
        let header = RtpHeader {
            version: 2,
            payload_type: PT_OPUS,
            sequence: 12345,
            timestamp: 0xDEAD_BEEF,
            ssrc: 0xCAFE_BABE,
            payload_length: 4,
            flags: FLAG_MARKER | FLAG_VAD_ACTIVE,
        };
        let packet = RtpPacket::encode(header, &[1, 2, 3, 4]);
        let parsed = RtpPacket::decode(&packet).unwrap();
        assert_eq!(parsed.header.sequence, 12345);
        assert_eq!(parsed.header.timestamp, 0xDEAD_BEEF);
        assert_eq!(parsed.header.ssrc, 0xCAFE_BABE);
        assert!(parsed.header.marker());
        assert!(parsed.header.vad_active());
        assert_eq!(parsed.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_short_datagram() {
        let buf = [2u8; 10];
        assert!(matches!(RtpPacket::decode(&buf), Err(ProtocolError::InvalidRtp)));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = 1;
        assert!(matches!(RtpPacket::decode(&buf), Err(ProtocolError::InvalidRtp)));
    }

    #[test]
    fn seq_distance_wraps() {
        assert_eq!(seq_distance(1, 0), 1);
        assert_eq!(seq_distance(0, 1), -1);
        assert_eq!(seq_distance(0, 65535), 1);
        assert_eq!(seq_distance(65535, 0), -1);
    }
}
