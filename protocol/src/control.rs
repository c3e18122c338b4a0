//! TCP session control message bodies (§4.1, §4.7, §4.8, §6).
//!
//! Every body here is preceded on the wire by the common 20-byte
//! [`crate::header::Header`]; this module only encodes/decodes the bytes
//! that follow it.

use byteorder::{ByteOrder, LittleEndian};

use crate::header::{self, Header, HEADER_LEN};
use crate::{read_fixed_str, write_fixed_str, ProtocolError, NAME_LEN};

pub const DEFAULT_TCP_PORT: u16 = 5000;

const IP_STR_LEN: usize = 16;

/// `HELLO` (0x0101): 4 B client_id + 4 B capability_flags + 32 B name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub client_id: u32,
    pub capability_flags: u32,
    pub client_name: String,
}

impl Hello {
    const BODY_LEN: usize = 4 + 4 + NAME_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(header::MSG_HELLO, Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.client_id);
        LittleEndian::write_u32(&mut body[4..8], self.capability_flags);
        write_fixed_str(&mut body[8..8 + NAME_LEN], &self.client_name);
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, Self::BODY_LEN)?;
        Ok(Self {
            client_id: LittleEndian::read_u32(&body[0..4]),
            capability_flags: LittleEndian::read_u32(&body[4..8]),
            client_name: read_fixed_str(&body[8..8 + NAME_LEN]),
        })
    }
}

/// `HELLO_ACK` (0x0102): 4 B result + 4 B assigned_id + 2 B audio_udp_port
/// + 2 B reserved + 8 B server_time_ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAck {
    pub result: u32,
    pub assigned_id: u32,
    pub audio_udp_port: u16,
    pub server_time_ms: u64,
}

impl HelloAck {
    const BODY_LEN: usize = 4 + 4 + 2 + 2 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(header::MSG_HELLO_ACK, Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.result);
        LittleEndian::write_u32(&mut body[4..8], self.assigned_id);
        LittleEndian::write_u16(&mut body[8..10], self.audio_udp_port);
        LittleEndian::write_u64(&mut body[12..20], self.server_time_ms);
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, Self::BODY_LEN)?;
        Ok(Self {
            result: LittleEndian::read_u32(&body[0..4]),
            assigned_id: LittleEndian::read_u32(&body[4..8]),
            audio_udp_port: LittleEndian::read_u16(&body[8..10]),
            server_time_ms: LittleEndian::read_u64(&body[12..20]),
        })
    }
}

/// `JOIN_SESSION` (0x0103): 4 B client_id + 2 B local_udp_port + 2 B reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinSession {
    pub client_id: u32,
    pub local_udp_port: u16,
}

impl JoinSession {
    const BODY_LEN: usize = 4 + 2 + 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(header::MSG_JOIN_SESSION, Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.client_id);
        LittleEndian::write_u16(&mut body[4..6], self.local_udp_port);
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, Self::BODY_LEN)?;
        Ok(Self {
            client_id: LittleEndian::read_u32(&body[0..4]),
            local_udp_port: LittleEndian::read_u16(&body[4..6]),
        })
    }
}

/// `JOIN_ACK`: 4 B result + 4 B ssrc + 8 B base_timestamp. Sent under the
/// distinct `MSG_JOIN_ACK` type (see `header::MSG_JOIN_ACK` doc comment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAck {
    pub result: u32,
    pub ssrc: u32,
    pub base_timestamp: u64,
}

impl JoinAck {
    const BODY_LEN: usize = 4 + 4 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(header::MSG_JOIN_ACK, Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.result);
        LittleEndian::write_u32(&mut body[4..8], self.ssrc);
        LittleEndian::write_u64(&mut body[8..16], self.base_timestamp);
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, Self::BODY_LEN)?;
        Ok(Self {
            result: LittleEndian::read_u32(&body[0..4]),
            ssrc: LittleEndian::read_u32(&body[4..8]),
            base_timestamp: LittleEndian::read_u64(&body[8..16]),
        })
    }
}

/// `LEAVE_SESSION` (0x0104): header only, no body.
pub fn encode_leave_session() -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN];
    Header::new(header::MSG_LEAVE_SESSION, 0).encode((&mut out[..]).try_into().unwrap());
    out
}

/// `HEARTBEAT` (0x0105): 4 B client_id + 8 B local_time_ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub client_id: u32,
    pub local_time_ms: u64,
}

impl Heartbeat {
    const BODY_LEN: usize = 4 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(header::MSG_HEARTBEAT, Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.client_id);
        LittleEndian::write_u64(&mut body[4..12], self.local_time_ms);
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, Self::BODY_LEN)?;
        Ok(Self {
            client_id: LittleEndian::read_u32(&body[0..4]),
            local_time_ms: LittleEndian::read_u64(&body[4..12]),
        })
    }
}

/// The action carried by `AUDIO_START`/`STOP`/`MUTE`/`UNMUTE` (§6). The four
/// message types share one body shape; `action` disambiguates in case a
/// caller decodes generically, but in practice the header's `msg_type` is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioAction {
    Start,
    Stop,
    Mute,
    Unmute,
}

impl AudioAction {
    pub fn msg_type(self) -> u16 {
        match self {
            Self::Start => header::MSG_AUDIO_START,
            Self::Stop => header::MSG_AUDIO_STOP,
            Self::Mute => header::MSG_AUDIO_MUTE,
            Self::Unmute => header::MSG_AUDIO_UNMUTE,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::Stop,
            2 => Self::Mute,
            3 => Self::Unmute,
            _ => Self::Start,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Start => 0,
            Self::Stop => 1,
            Self::Mute => 2,
            Self::Unmute => 3,
        }
    }
}

/// Body shared by `AUDIO_START/STOP/MUTE/UNMUTE`: 4 B client_id + 1 B action
/// + 1 B muted + 2 B reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioControl {
    pub client_id: u32,
    pub action: AudioAction,
    pub muted: bool,
}

impl AudioControl {
    const BODY_LEN: usize = 4 + 1 + 1 + 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + Self::BODY_LEN];
        Header::new(self.action.msg_type(), Self::BODY_LEN as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        LittleEndian::write_u32(&mut body[0..4], self.client_id);
        body[4] = self.action.to_byte();
        body[5] = self.muted as u8;
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, Self::BODY_LEN)?;
        Ok(Self {
            client_id: LittleEndian::read_u32(&body[0..4]),
            action: AudioAction::from_byte(body[4]),
            muted: body[5] != 0,
        })
    }
}

/// Peer type tag carried in `PeerInfo::peer_type` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    Server,
    SelfPeer,
    Other,
}

impl PeerType {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Server,
            1 => Self::SelfPeer,
            _ => Self::Other,
        }
    }
    fn to_byte(self) -> u8 {
        match self {
            Self::Server => 0,
            Self::SelfPeer => 1,
            Self::Other => 2,
        }
    }
}

/// `PeerInfo` record (§6): 4 B client_id + 4 B ssrc + 32 B name + 16 B ip
/// + 2 B udp_port + 1 B talking + 1 B muted + 1 B audio_active + 1 B type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub client_id: u32,
    pub ssrc: u32,
    pub name: String,
    pub ip: String,
    pub udp_port: u16,
    pub talking: bool,
    pub muted: bool,
    pub audio_active: bool,
    pub peer_type: PeerType,
}

impl PeerInfo {
    pub const WIRE_LEN: usize = 4 + 4 + NAME_LEN + IP_STR_LEN + 2 + 1 + 1 + 1 + 1;

    pub fn encode_into(&self, body: &mut [u8]) {
        LittleEndian::write_u32(&mut body[0..4], self.client_id);
        LittleEndian::write_u32(&mut body[4..8], self.ssrc);
        let name_start = 8;
        write_fixed_str(&mut body[name_start..name_start + NAME_LEN], &self.name);
        let ip_start = name_start + NAME_LEN;
        write_fixed_str(&mut body[ip_start..ip_start + IP_STR_LEN], &self.ip);
        let port_off = ip_start + IP_STR_LEN;
        LittleEndian::write_u16(&mut body[port_off..port_off + 2], self.udp_port);
        body[port_off + 2] = self.talking as u8;
        body[port_off + 3] = self.muted as u8;
        body[port_off + 4] = self.audio_active as u8;
        body[port_off + 5] = self.peer_type.to_byte();
    }

    pub fn decode_from(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, Self::WIRE_LEN)?;
        let name_start = 8;
        let ip_start = name_start + NAME_LEN;
        let port_off = ip_start + IP_STR_LEN;
        Ok(Self {
            client_id: LittleEndian::read_u32(&body[0..4]),
            ssrc: LittleEndian::read_u32(&body[4..8]),
            name: read_fixed_str(&body[name_start..name_start + NAME_LEN]),
            ip: read_fixed_str(&body[ip_start..ip_start + IP_STR_LEN]),
            udp_port: LittleEndian::read_u16(&body[port_off..port_off + 2]),
            talking: body[port_off + 2] != 0,
            muted: body[port_off + 3] != 0,
            audio_active: body[port_off + 4] != 0,
            peer_type: PeerType::from_byte(body[port_off + 5]),
        })
    }
}

/// `PEER_LIST` (0x0301): 1 B peer_count + 3 B reserved + `peer_count` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerList {
    pub peers: Vec<PeerInfo>,
}

impl PeerList {
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 4 + self.peers.len() * PeerInfo::WIRE_LEN;
        let mut out = vec![0u8; HEADER_LEN + body_len];
        Header::new(header::MSG_PEER_LIST, body_len as u32)
            .encode(out[..HEADER_LEN].try_into().unwrap());
        let body = &mut out[HEADER_LEN..];
        body[0] = self.peers.len().min(u8::MAX as usize) as u8;
        let mut offset = 4;
        for peer in &self.peers {
            peer.encode_into(&mut body[offset..offset + PeerInfo::WIRE_LEN]);
            offset += PeerInfo::WIRE_LEN;
        }
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        require(body, 4)?;
        let count = body[0] as usize;
        let mut peers = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            require(&body[offset..], PeerInfo::WIRE_LEN)?;
            peers.push(PeerInfo::decode_from(&body[offset..offset + PeerInfo::WIRE_LEN])?);
            offset += PeerInfo::WIRE_LEN;
        }
        Ok(Self { peers })
    }
}

/// `PEER_JOIN`/`PEER_LEAVE`/`PEER_STATE` (0x0302–0x0304): one `PeerInfo` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEventKind {
    Join,
    Leave,
    State,
}

impl PeerEventKind {
    fn msg_type(self) -> u16 {
        match self {
            Self::Join => header::MSG_PEER_JOIN,
            Self::Leave => header::MSG_PEER_LEAVE,
            Self::State => header::MSG_PEER_STATE,
        }
    }
}

pub fn encode_peer_event(kind: PeerEventKind, peer: &PeerInfo) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN + PeerInfo::WIRE_LEN];
    Header::new(kind.msg_type(), PeerInfo::WIRE_LEN as u32)
        .encode(out[..HEADER_LEN].try_into().unwrap());
    peer.encode_into(&mut out[HEADER_LEN..]);
    out
}

fn require(buf: &[u8], need: usize) -> Result<(), ProtocolError> {
    if buf.len() < need {
        Err(ProtocolError::Truncated { need, got: buf.len() })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let hello = Hello {
            client_id: 9,
            capability_flags: 0b101,
            client_name: "bob".into(),
        };
        let bytes = hello.encode();
        let parsed = Hello::decode_body(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, hello);
    }

    #[test]
    fn join_ack_uses_distinct_message_type() {
        let ack = JoinAck { result: 0, ssrc: 5, base_timestamp: 48_000 };
        let bytes = ack.encode();
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.msg_type, header::MSG_JOIN_ACK);
        assert_ne!(header.msg_type, header::MSG_LEAVE_SESSION);
    }

    #[test]
    fn peer_list_roundtrip() {
        let list = PeerList {
            peers: vec![
                PeerInfo {
                    client_id: 1,
                    ssrc: 1,
                    name: "alice".into(),
                    ip: "192.168.1.2".into(),
                    udp_port: 6001,
                    talking: true,
                    muted: false,
                    audio_active: true,
                    peer_type: PeerType::Other,
                },
                PeerInfo {
                    client_id: 2,
                    ssrc: 2,
                    name: "carol".into(),
                    ip: "192.168.1.3".into(),
                    udp_port: 6002,
                    talking: false,
                    muted: true,
                    audio_active: true,
                    peer_type: PeerType::Other,
                },
            ],
        };
        let bytes = list.encode();
        let parsed = PeerList::decode_body(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn audio_control_roundtrip() {
        let ctrl = AudioControl { client_id: 3, action: AudioAction::Mute, muted: true };
        let bytes = ctrl.encode();
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.msg_type, header::MSG_AUDIO_MUTE);
        let parsed = AudioControl::decode_body(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, ctrl);
    }
}
