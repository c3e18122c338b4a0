//! Client-side session state machine (§3 `Session`, §4.8).
//!
//! `connect`/`join_session` run synchronously on the caller's thread for
//! the initial handshake, the same way the teacher's `NetworkAudioClient::
//! connect` blocks for its first acknowledgement before handing control
//! back. Once joined, four background threads take over: a control reader
//! for async `PEER_*` fan-out, a heartbeat ticker, an RTP ingest loop
//! feeding the [`Mixer`], and a playback pump draining it into an
//! [`AudioSink`].

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use lanvoice_protocol::control::{
    encode_leave_session, Heartbeat, Hello, HelloAck, JoinAck, JoinSession, PeerInfo,
};
use lanvoice_protocol::header;
use lanvoice_protocol::rtp::{RtpHeader, RtpPacket};

use crate::audio_io::AudioSink;
use crate::codec::Decoder;
use crate::error::CoreError;
use crate::events::{Event, EventSender};
use crate::mixer::{DecoderFactory, Mixer};
use crate::transport::{tcp, udp};
use crate::SAMPLES_PER_FRAME;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CONTROL_READ_TIMEOUT: Duration = Duration::from_millis(500);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const PLAYBACK_IDLE_SLEEP: Duration = Duration::from_millis(5);
const UDP_BUF_LEN: usize = 2048;

struct ConnectionState {
    client_id: u32,
    ssrc: u32,
    server_udp_addr: SocketAddr,
    write_stream: Arc<Mutex<TcpStream>>,
}

/// Client-side TCP control connection, RTP ingest/playback pump, and peer
/// table (§4.8).
pub struct SessionClient {
    state: Mutex<Option<ConnectionState>>,
    udp_socket: Mutex<Option<Arc<UdpSocket>>>,
    running: Arc<AtomicBool>,
    in_session: Arc<AtomicBool>,
    heartbeat_enabled: Arc<AtomicBool>,
    peers: Arc<Mutex<HashMap<u32, PeerInfo>>>,
    mixer: Arc<Mixer>,
    sink: Mutex<Option<Box<dyn AudioSink>>>,
    playback_volume: Arc<Mutex<f32>>,
    events: EventSender,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl SessionClient {
    pub fn new(decoder_factory: DecoderFactory, sink: Box<dyn AudioSink>, events: EventSender) -> Self {
        Self {
            state: Mutex::new(None),
            udp_socket: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            in_session: Arc::new(AtomicBool::new(false)),
            heartbeat_enabled: Arc::new(AtomicBool::new(false)),
            peers: Arc::new(Mutex::new(HashMap::new())),
            mixer: Arc::new(Mixer::new(decoder_factory)),
            sink: Mutex::new(Some(sink)),
            playback_volume: Arc::new(Mutex::new(1.0)),
            events,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Sets the gain applied to every mixed frame before it reaches the
    /// sink (§4.6).
    pub fn set_playback_volume(&self, gain: f32) {
        *self.playback_volume.lock() = gain.max(0.0);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn is_in_session(&self) -> bool {
        self.in_session.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    /// Reachability test plus `HELLO`/`HELLO_ACK` handshake (§4.8 IDLE →
    /// CONNECTED). Runs synchronously on the caller's thread.
    pub fn connect(&self, tcp_addr: SocketAddr, display_name: &str) -> Result<(), CoreError> {
        if self.state.lock().is_some() {
            return Err(CoreError::AlreadyRunning("client"));
        }

        let mut stream = tcp::connect(tcp_addr, CONNECT_TIMEOUT).map_err(|_| CoreError::ConnectTimeout {
            addr: tcp_addr.to_string(),
        })?;
        stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;

        let (udp_socket, local_udp_port) = udp::bind_audio_socket(0)?;
        udp_socket.set_read_timeout(Some(Duration::from_millis(50)))?;
        let _ = local_udp_port;

        let hello = Hello {
            client_id: 0,
            capability_flags: 0,
            client_name: display_name.to_string(),
        };
        stream.write_all(&hello.encode())?;

        let frame = tcp::framed_read(&mut stream)?;
        let header = lanvoice_protocol::header::Header::decode(&frame)?;
        if header.msg_type != header::MSG_HELLO_ACK {
            return Err(CoreError::Protocol(lanvoice_protocol::ProtocolError::BadMagic));
        }
        let ack = HelloAck::decode_body(&frame[lanvoice_protocol::header::HEADER_LEN..])?;
        if ack.result != 0 {
            return Err(CoreError::JoinRejected(ack.result));
        }

        let server_udp_addr = SocketAddr::new(tcp_addr.ip(), ack.audio_udp_port);

        *self.state.lock() = Some(ConnectionState {
            client_id: ack.assigned_id,
            ssrc: ack.assigned_id,
            server_udp_addr,
            write_stream: Arc::new(Mutex::new(stream)),
        });
        *self.udp_socket.lock() = Some(Arc::new(udp_socket));
        self.running.store(true, Ordering::SeqCst);

        let _ = self.events.send(Event::Connected { server_name: tcp_addr.to_string() });
        tracing::info!(%tcp_addr, assigned_id = ack.assigned_id, "connected to server");
        Ok(())
    }

    /// `JOIN_SESSION` → `JOIN_ACK` → `PEER_LIST` (§4.8 CONNECTED → IN_SESSION),
    /// then spawns the background threads that carry the session forward.
    pub fn join_session(&self) -> Result<(), CoreError> {
        let (client_id, ssrc, write_stream) = {
            let state = self.state.lock();
            let state = state.as_ref().ok_or(CoreError::NotConnected)?;
            (state.client_id, state.ssrc, state.write_stream.clone())
        };

        let local_udp_port = self
            .udp_socket
            .lock()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
            .ok_or(CoreError::NotConnected)?;

        let mut read_stream = {
            let stream = write_stream.lock();
            stream.try_clone()?
        };

        let join = JoinSession { client_id, local_udp_port };
        {
            let mut stream = write_stream.lock();
            stream.write_all(&join.encode())?;
        }

        let ack_frame = tcp::framed_read(&mut read_stream)?;
        let ack_header = lanvoice_protocol::header::Header::decode(&ack_frame)?;
        if ack_header.msg_type != header::MSG_JOIN_ACK {
            return Err(CoreError::JoinRejected(u32::MAX));
        }
        let ack = JoinAck::decode_body(&ack_frame[lanvoice_protocol::header::HEADER_LEN..])?;
        if ack.result != 0 {
            return Err(CoreError::JoinRejected(ack.result));
        }

        let list_frame = tcp::framed_read(&mut read_stream)?;
        let list_header = lanvoice_protocol::header::Header::decode(&list_frame)?;
        if list_header.msg_type != header::MSG_PEER_LIST {
            return Err(CoreError::JoinRejected(u32::MAX));
        }
        let list = lanvoice_protocol::control::PeerList::decode_body(
            &list_frame[lanvoice_protocol::header::HEADER_LEN..],
        )?;
        {
            let mut peers = self.peers.lock();
            peers.clear();
            for peer in list.peers {
                peers.insert(peer.client_id, peer);
            }
        }

        self.mixer.reset();
        self.in_session.store(true, Ordering::SeqCst);
        self.heartbeat_enabled.store(true, Ordering::SeqCst);

        self.spawn_control_reader(read_stream);
        self.spawn_heartbeat_ticker(client_id, write_stream);
        self.spawn_ingest(ssrc);
        self.spawn_playback_pump();

        tracing::info!(client_id, ssrc = ack.ssrc, "joined session");
        Ok(())
    }

    fn spawn_control_reader(&self, mut read_stream: TcpStream) {
        let running = self.running.clone();
        let in_session = self.in_session.clone();
        let peers = self.peers.clone();
        let events = self.events.clone();
        let _ = read_stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT));

        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) && in_session.load(Ordering::SeqCst) {
                let frame = match tcp::framed_read(&mut read_stream) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                let Ok(hdr) = lanvoice_protocol::header::Header::decode(&frame) else { continue };
                let body = &frame[lanvoice_protocol::header::HEADER_LEN..];

                match hdr.msg_type {
                    header::MSG_PEER_JOIN => {
                        let Ok(peer) = PeerInfo::decode_from(body) else { continue };
                        peers.lock().insert(peer.client_id, peer.clone());
                        let _ = events.send(Event::PeerJoined(peer));
                    }
                    header::MSG_PEER_LEAVE => {
                        let Ok(peer) = PeerInfo::decode_from(body) else { continue };
                        peers.lock().remove(&peer.client_id);
                        let _ = events.send(Event::PeerLeft(peer.client_id));
                    }
                    header::MSG_PEER_STATE => {
                        let Ok(peer) = PeerInfo::decode_from(body) else { continue };
                        peers.lock().insert(peer.client_id, peer.clone());
                        let _ = events.send(Event::PeerStateChanged(peer));
                    }
                    header::MSG_HEARTBEAT => {}
                    _ => {
                        tracing::trace!(msg_type = hdr.msg_type, "unhandled control message");
                    }
                }
            }
        });
        self.threads.lock().push(handle);
    }

    fn spawn_heartbeat_ticker(&self, client_id: u32, write_stream: Arc<Mutex<TcpStream>>) {
        let running = self.running.clone();
        let in_session = self.in_session.clone();
        let heartbeat_enabled = self.heartbeat_enabled.clone();

        let is_live = |r: &Arc<AtomicBool>, s: &Arc<AtomicBool>, h: &Arc<AtomicBool>| {
            r.load(Ordering::SeqCst) && s.load(Ordering::SeqCst) && h.load(Ordering::SeqCst)
        };

        let handle = std::thread::spawn(move || {
            while is_live(&running, &in_session, &heartbeat_enabled) {
                std::thread::sleep(HEARTBEAT_INTERVAL);
                if !is_live(&running, &in_session, &heartbeat_enabled) {
                    break;
                }
                let local_time_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                let hb = Heartbeat { client_id, local_time_ms };
                let mut stream = write_stream.lock();
                if stream.write_all(&hb.encode()).is_err() {
                    break;
                }
            }
        });
        self.threads.lock().push(handle);
    }

    fn spawn_ingest(&self, own_ssrc: u32) {
        let running = self.running.clone();
        let in_session = self.in_session.clone();
        let udp_socket = self.udp_socket.lock().clone();
        let mixer = self.mixer.clone();

        let Some(socket) = udp_socket else { return };

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; UDP_BUF_LEN];
            while running.load(Ordering::SeqCst) && in_session.load(Ordering::SeqCst) {
                match udp::recv_rtp(&socket, &mut buf) {
                    Ok(Some((packet, _from))) => {
                        if packet.header.ssrc == own_ssrc {
                            continue;
                        }
                        mixer.put(&packet.header, &packet.payload);
                    }
                    Ok(None) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => {}
                }
            }
        });
        self.threads.lock().push(handle);
    }

    fn spawn_playback_pump(&self) {
        let running = self.running.clone();
        let in_session = self.in_session.clone();
        let mixer = self.mixer.clone();
        let sink = self.sink.lock().take();
        let playback_volume = self.playback_volume.clone();

        let Some(mut sink) = sink else { return };

        let handle = std::thread::spawn(move || {
            let mut pulls = 0u32;
            while running.load(Ordering::SeqCst) && in_session.load(Ordering::SeqCst) {
                let mut frame = [0i16; SAMPLES_PER_FRAME];
                let n = mixer.get_mixed(&mut frame);
                if n > 0 {
                    let gain = *playback_volume.lock();
                    if gain != 1.0 {
                        for sample in frame[..n].iter_mut() {
                            *sample = (*sample as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                        }
                    }
                    sink.play_frame(&frame[..n]);
                } else {
                    std::thread::sleep(PLAYBACK_IDLE_SLEEP);
                }
                pulls = pulls.wrapping_add(1);
                if pulls % 1000 == 0 {
                    mixer.gc();
                }
            }
        });
        self.threads.lock().push(handle);
    }

    /// Sends one RTP datagram to the server's audio socket (§4.9: the
    /// sequence/timestamp counters themselves are owned by the
    /// orchestrator, not here).
    pub fn send_rtp(&self, header: RtpHeader, payload: &[u8]) -> Result<(), CoreError> {
        let (socket, dest) = {
            let udp = self.udp_socket.lock();
            let state = self.state.lock();
            match (udp.as_ref(), state.as_ref()) {
                (Some(socket), Some(state)) => (socket.clone(), state.server_udp_addr),
                _ => return Err(CoreError::NotConnected),
            }
        };
        udp::send_rtp(&socket, dest, header, payload)?;
        Ok(())
    }

    pub fn own_ssrc(&self) -> Option<u32> {
        self.state.lock().as_ref().map(|s| s.ssrc)
    }

    /// Silences the heartbeat ticker without leaving the session or closing
    /// the TCP connection, so a server's heartbeat-timeout eviction (§4.7)
    /// can be exercised from a client that otherwise looks fully alive.
    pub fn stop_heartbeat(&self) {
        self.heartbeat_enabled.store(false, Ordering::SeqCst);
    }

    /// `LEAVE_SESSION` (§4.8 IN_SESSION → CONNECTED): stops ingest/playback
    /// while leaving the TCP control connection up.
    pub fn leave_session(&self) -> Result<(), CoreError> {
        if !self.in_session.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.heartbeat_enabled.store(false, Ordering::SeqCst);
        if let Some(state) = self.state.lock().as_ref() {
            let mut stream = state.write_stream.lock();
            let _ = stream.write_all(&encode_leave_session());
        }
        self.join_threads();
        self.mixer.reset();
        self.peers.lock().clear();
        Ok(())
    }

    /// Full teardown (§4.8 any state → IDLE): closes sockets, joins every
    /// background thread, and drops connection state.
    pub fn disconnect(&self) {
        self.in_session.store(false, Ordering::SeqCst);
        self.heartbeat_enabled.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.join_threads();
        *self.state.lock() = None;
        *self.udp_socket.lock() = None;
        self.mixer.reset();
        self.peers.lock().clear();
        let _ = self.events.send(Event::Disconnected);
    }

    fn join_threads(&self) {
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[allow(dead_code)]
fn default_decoder_factory() -> DecoderFactory {
    Arc::new(|| Box::new(crate::codec::PcmPassthroughCodec) as Box<dyn Decoder>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_io::NullAudioSink;

    #[test]
    fn fresh_client_is_not_connected() {
        let (tx, _rx) = crate::events::channel();
        let client = SessionClient::new(default_decoder_factory(), Box::new(NullAudioSink), tx);
        assert!(!client.is_connected());
        assert!(!client.is_in_session());
        assert!(client.peers().is_empty());
    }

    #[test]
    fn send_rtp_without_connection_fails() {
        let (tx, _rx) = crate::events::channel();
        let client = SessionClient::new(default_decoder_factory(), Box::new(NullAudioSink), tx);
        let header = RtpHeader::new(lanvoice_protocol::rtp::PT_RAW_PCM, 1);
        assert!(client.send_rtp(header, &[]).is_err());
    }

    #[test]
    fn disconnect_before_connect_is_a_no_op() {
        let (tx, _rx) = crate::events::channel();
        let client = SessionClient::new(default_decoder_factory(), Box::new(NullAudioSink), tx);
        client.disconnect();
        assert!(!client.is_connected());
    }
}
