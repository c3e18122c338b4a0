use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use lanvoice_protocol::rtp::RtpPacket;

const AUDIO_RECV_BUF: usize = 256 * 1024;
const AUDIO_SEND_BUF: usize = 128 * 1024;

/// Binds a UDP socket for peer discovery with `SO_BROADCAST` + `SO_REUSEADDR`
/// (§4.2, §4.3). Port 0 lets the OS assign an ephemeral port.
pub fn bind_broadcast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    Ok(socket)
}

/// Binds the RTP audio socket: `SO_REUSEADDR`, 256 KB receive buffer, 128 KB
/// send buffer (§4.3). Returns the socket plus the port actually bound,
/// since callers may pass 0 and let the OS choose.
pub fn bind_audio_socket(port: u16) -> std::io::Result<(UdpSocket, u16)> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(AUDIO_RECV_BUF)?;
    socket.set_send_buffer_size(AUDIO_SEND_BUF)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    let bound_port = socket.local_addr()?.as_socket().map(|a| a.port()).unwrap_or(port);
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(Duration::from_millis(50)))?;
    Ok((socket, bound_port))
}

/// Packs and sends one RTP datagram (§4.3: payload capped at 512 bytes).
pub fn send_rtp(
    socket: &UdpSocket,
    dest: SocketAddr,
    header: lanvoice_protocol::rtp::RtpHeader,
    payload: &[u8],
) -> std::io::Result<()> {
    let datagram = RtpPacket::encode(header, payload);
    socket.send_to(&datagram, dest)?;
    Ok(())
}

/// Receives one RTP datagram, rejecting anything that fails the header
/// validation in [`RtpPacket::decode`] (§4.3).
pub fn recv_rtp(socket: &UdpSocket, buf: &mut [u8]) -> std::io::Result<Option<(RtpPacket, SocketAddr)>> {
    match socket.recv_from(buf) {
        Ok((len, from)) => match RtpPacket::decode(&buf[..len]) {
            Ok(packet) => Ok(Some((packet, from))),
            Err(_) => Ok(None),
        },
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
