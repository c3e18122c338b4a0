//! UDP broadcast discovery wire structures (§4.2, §6).

use byteorder::{ByteOrder, LittleEndian};

use crate::header::{Header, HEADER_LEN};
use crate::{read_fixed_str, write_fixed_str, ProtocolError, NAME_LEN};

pub const DEFAULT_DISCOVERY_PORT: u16 = 37020;

/// Capability bitmask (§6).
pub const CAP_OPUS: u32 = 0x0001;
pub const CAP_VAD: u32 = 0x0002;
pub const CAP_JITTER: u32 = 0x0004;

const VERSION_STR_LEN: usize = 16;

/// `DISCOVERY_REQUEST` body: 4 B client_id + 4 B service_mask + 32 B name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub client_id: u32,
    pub service_mask: u32,
    pub client_name: String,
}

impl DiscoveryRequest {
    const BODY_LEN: usize = 4 + 4 + NAME_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(crate::header::MSG_DISCOVERY_REQUEST, Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.client_id);
        LittleEndian::write_u32(&mut body[4..8], self.service_mask);
        write_fixed_str(&mut body[8..8 + NAME_LEN], &self.client_name);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::decode(buf)?;
        let body = &buf[HEADER_LEN..];
        if body.len() < Self::BODY_LEN {
            return Err(ProtocolError::Truncated {
                need: Self::BODY_LEN,
                got: body.len(),
            });
        }
        let _ = header;
        Ok(Self {
            client_id: LittleEndian::read_u32(&body[0..4]),
            service_mask: LittleEndian::read_u32(&body[4..8]),
            client_name: read_fixed_str(&body[8..8 + NAME_LEN]),
        })
    }
}

/// `DISCOVERY_RESPONSE` body (§6): fixed-layout record describing one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub server_id: u32,
    pub tcp_port: u16,
    pub audio_udp_port: u16,
    pub capability_flags: u32,
    pub current_peers: u8,
    pub max_peers: u8,
    pub server_name: String,
    pub version_str: String,
}

impl DiscoveryResponse {
    const BODY_LEN: usize = 4 + 2 + 2 + 4 + 1 + 1 + 2 + NAME_LEN + VERSION_STR_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(crate::header::MSG_DISCOVERY_RESPONSE, Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.server_id);
        LittleEndian::write_u16(&mut body[4..6], self.tcp_port);
        LittleEndian::write_u16(&mut body[6..8], self.audio_udp_port);
        LittleEndian::write_u32(&mut body[8..12], self.capability_flags);
        body[12] = self.current_peers;
        body[13] = self.max_peers;
        // body[14..16] reserved, left zero.
        let name_start = 16;
        write_fixed_str(&mut body[name_start..name_start + NAME_LEN], &self.server_name);
        let ver_start = name_start + NAME_LEN;
        write_fixed_str(&mut body[ver_start..ver_start + VERSION_STR_LEN], &self.version_str);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let _header = Header::decode(buf)?;
        let body = &buf[HEADER_LEN..];
        if body.len() < Self::BODY_LEN {
            return Err(ProtocolError::Truncated {
                need: Self::BODY_LEN,
                got: body.len(),
            });
        }
        let name_start = 16;
        let ver_start = name_start + NAME_LEN;
        Ok(Self {
            server_id: LittleEndian::read_u32(&body[0..4]),
            tcp_port: LittleEndian::read_u16(&body[4..6]),
            audio_udp_port: LittleEndian::read_u16(&body[6..8]),
            capability_flags: LittleEndian::read_u32(&body[8..12]),
            current_peers: body[12],
            max_peers: body[13],
            server_name: read_fixed_str(&body[name_start..name_start + NAME_LEN]),
            version_str: read_fixed_str(&body[ver_start..ver_start + VERSION_STR_LEN]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = DiscoveryRequest {
            client_id: 42,
            service_mask: CAP_OPUS | CAP_VAD,
            client_name: "alice".into(),
        };
        let bytes = req.encode();
        assert_eq!(DiscoveryRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn response_roundtrip() {
        let resp = DiscoveryResponse {
            server_id: 7,
            tcp_port: 5000,
            audio_udp_port: 6000,
            capability_flags: CAP_OPUS | CAP_VAD | CAP_JITTER,
            current_peers: 3,
            max_peers: 16,
            server_name: "living-room".into(),
            version_str: "0.1.0".into(),
        };
        let bytes = resp.encode();
        assert_eq!(DiscoveryResponse::decode(&bytes).unwrap(), resp);
    }

    #[test]
    fn long_name_is_truncated_not_overflowed() {
        let name: String = "x".repeat(100);
        let req = DiscoveryRequest {
            client_id: 1,
            service_mask: 0,
            client_name: name,
        };
        let bytes = req.encode();
        let parsed = DiscoveryRequest::decode(&bytes).unwrap();
        assert_eq!(parsed.client_name.len(), NAME_LEN);
    }
}
