use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use lanvoice_protocol::header::{Header, HEADER_LEN};
use lanvoice_protocol::{ProtocolError, MAX_CONTROL_PAYLOAD};

/// Binds a TCP listen socket: `SO_REUSEADDR`, `TCP_NODELAY` on accepted
/// connections, backlog `SOMAXCONN` (§4.3).
pub fn listen(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    socket.listen(i32::MAX)?;
    Ok(socket.into())
}

/// Connects with a caller-driven timeout, used as the reachability test
/// before a client commits to a server (§4.3, §4.8).
pub fn connect(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub fn apply_nodelay(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)
}

/// Reads exactly one length-framed control packet: the 20-byte header, then
/// exactly `payload_length` more bytes, bounded by
/// [`MAX_CONTROL_PAYLOAD`] (§4.3). A short read or validation failure means
/// the connection is considered lost — callers should close it, not retry
/// the read.
pub struct FramedReader;

impl FramedReader {
    /// Returns the full frame (header bytes + payload bytes) on success.
    pub fn read_one(stream: &mut TcpStream) -> Result<Vec<u8>, ProtocolError> {
        let mut header_buf = [0u8; HEADER_LEN];
        read_exact_or_lost(stream, &mut header_buf)?;
        let header = Header::decode(&header_buf)?;

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                len: header.payload_length,
                max: MAX_CONTROL_PAYLOAD,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
        frame.extend_from_slice(&header_buf);
        if payload_len > 0 {
            let mut payload = vec![0u8; payload_len];
            read_exact_or_lost(stream, &mut payload)?;
            frame.extend_from_slice(&payload);
        }
        Ok(frame)
    }
}

fn read_exact_or_lost(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ProtocolError> {
    stream
        .read_exact(buf)
        .map_err(|_| ProtocolError::Truncated { need: buf.len(), got: 0 })
}

/// Writes a full frame, looping over partial writes the way
/// `Network_TcpSend` does in the original implementation.
pub fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(frame)
}

/// The framed-read function exported at module scope for the common case
/// (owning a `&mut TcpStream` directly rather than going through
/// `FramedReader`).
pub fn framed_read(stream: &mut TcpStream) -> Result<Vec<u8>, ProtocolError> {
    FramedReader::read_one(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};

    #[test]
    fn framed_read_rejects_bad_magic() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&[0u8; HEADER_LEN]).unwrap();
        });
        let mut client = StdStream::connect(addr).unwrap();
        let result = framed_read(&mut client);
        assert!(matches!(result, Err(ProtocolError::BadMagic)));
        handle.join().unwrap();
    }

    #[test]
    fn framed_read_rejects_oversize_payload() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let header = Header::new(lanvoice_protocol::header::MSG_HELLO, u32::MAX);
            let mut buf = [0u8; HEADER_LEN];
            header.encode(&mut buf);
            sock.write_all(&buf).unwrap();
        });
        let mut client = StdStream::connect(addr).unwrap();
        let result = framed_read(&mut client);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
        handle.join().unwrap();
    }
}
