//! Server-side session state machine (§3 `Session`, §4.7).
//!
//! One thread per accepted TCP connection reads that client's control
//! frames (§9 DESIGN NOTES: a thread-per-connection model is "equally
//! valid at ≤16 participants and simpler to reason about" than the
//! original's `select`-based multiplexed reader, and is what this crate
//! uses). A second thread drains the shared UDP audio socket and fans
//! inbound RTP out to every other audio-active session. Grounded on the
//! teacher's `Mixer` (single `RwLock<Vec<Channel>>`, snapshot-then-iterate
//! reads) for the session-table locking discipline, and on
//! `examples/original_source/src/network.c`'s `Network_TcpRecvPacket` for
//! the exact point at which a malformed frame or short read tears down a
//! connection.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use lanvoice_protocol::control::{
    AudioAction, AudioControl, Heartbeat, Hello, HelloAck, JoinAck, JoinSession, PeerEventKind,
    PeerInfo, PeerList, PeerType,
};
use lanvoice_protocol::header;
use lanvoice_protocol::rtp::RtpPacket;

use crate::error::CoreError;
use crate::events::{Event, EventSender};
use crate::transport::{tcp, udp};

/// Heartbeat silence longer than this evicts a session (§4.7, §5).
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout on each per-connection socket, short enough to notice
/// `running` going false and to re-check heartbeat age promptly (§5).
const CONTROL_READ_TIMEOUT: Duration = Duration::from_millis(500);
const UDP_BUF_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    HelloOk,
    Joined,
    Left,
    Closed,
}

struct SessionMut {
    name: String,
    write_stream: TcpStream,
    udp_port: Option<u16>,
    udp_remote_addr: Option<SocketAddr>,
    last_heartbeat: Instant,
    state: SessionState,
    audio_active: bool,
    talking: bool,
    muted: bool,
}

/// One connected client, keyed by `client_id` in the server's session
/// table (§3).
pub struct Session {
    pub client_id: u32,
    pub ssrc: u32,
    pub peer_tcp_addr: SocketAddr,
    inner: Mutex<SessionMut>,
}

impl Session {
    fn peer_info(&self) -> PeerInfo {
        let inner = self.inner.lock();
        PeerInfo {
            client_id: self.client_id,
            ssrc: self.ssrc,
            name: inner.name.clone(),
            ip: self.peer_tcp_addr.ip().to_string(),
            udp_port: inner.udp_port.unwrap_or(0),
            talking: inner.talking,
            muted: inner.muted,
            audio_active: inner.audio_active,
            peer_type: PeerType::Other,
        }
    }

    fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn send(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        inner.write_stream.write_all(frame)
    }
}

/// Occupancy snapshot for discovery responses (§4.2, §6).
pub struct Occupancy {
    pub current: u8,
    pub max: u8,
}

pub struct SessionServerConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub max_peers: u8,
}

/// The server-side session table plus its TCP acceptor and UDP fan-out
/// threads (§4.7).
pub struct SessionServer {
    max_peers: u8,
    listener: TcpListener,
    udp_socket: Arc<std::net::UdpSocket>,
    udp_port: u16,
    sessions: Arc<Mutex<HashMap<u32, Arc<Session>>>>,
    next_client_id: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    events: EventSender,
    started_at: Instant,
}

impl SessionServer {
    pub fn start(config: SessionServerConfig, events: EventSender) -> Result<Self, CoreError> {
        let listener = tcp::listen(config.tcp_port)?;
        let (udp_socket, udp_port) = udp::bind_audio_socket(config.udp_port)?;
        udp_socket.set_read_timeout(Some(Duration::from_millis(50)))?;

        let server = Self {
            max_peers: config.max_peers,
            listener,
            udp_socket: Arc::new(udp_socket),
            udp_port,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_client_id: Arc::new(AtomicU32::new(1)),
            running: Arc::new(AtomicBool::new(true)),
            threads: Mutex::new(Vec::new()),
            events,
            started_at: Instant::now(),
        };

        server.spawn_acceptor();
        server.spawn_udp_forwarder();
        server.spawn_housekeeping();
        Ok(server)
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn occupancy(&self) -> Occupancy {
        let sessions = self.sessions.lock();
        let current = sessions
            .values()
            .filter(|s| s.state() == SessionState::Joined)
            .count()
            .min(u8::MAX as usize) as u8;
        Occupancy { current, max: self.max_peers }
    }

    fn spawn_acceptor(&self) {
        let listener = self.listener.try_clone().expect("clone tcp listener");
        let running = self.running.clone();
        let sessions = self.sessions.clone();
        let next_client_id = self.next_client_id.clone();
        let events = self.events.clone();
        let max_peers = self.max_peers;
        let started_at = self.started_at;
        let server_udp_port = self.udp_port;
        listener
            .set_nonblocking(true)
            .expect("tcp listener accepts non-blocking so the loop can notice `running` going false");
        let _ = started_at;

        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = tcp::apply_nodelay(&stream) {
                            tracing::warn!("failed to set TCP_NODELAY: {}", e);
                        }
                        let _ = stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT));
                        let _ = stream.set_nonblocking(false);

                        if sessions.lock().len() >= max_peers as usize {
                            tracing::warn!(%peer_addr, "server full, rejecting connection");
                            drop(stream);
                            continue;
                        }

                        spawn_connection_thread(
                            stream,
                            peer_addr,
                            sessions.clone(),
                            next_client_id.clone(),
                            events.clone(),
                            running.clone(),
                            server_udp_port,
                        );
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(_) => break,
                }
            }
        });
        self.threads.lock().push(handle);
    }

    fn spawn_udp_forwarder(&self) {
        let socket = self.udp_socket.clone();
        let sessions = self.sessions.clone();
        let running = self.running.clone();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; UDP_BUF_LEN];
            while running.load(Ordering::SeqCst) {
                match udp::recv_rtp(&socket, &mut buf) {
                    Ok(Some((packet, _from))) => {
                        let sender_ssrc = packet.header.ssrc;

                        // Snapshot the session list under the table lock,
                        // then release it before touching any per-session
                        // `inner` lock, so this never holds two levels of
                        // the same lock at once.
                        let all_sessions: Vec<Arc<Session>> =
                            sessions.lock().values().cloned().collect();

                        if let Some(session) = all_sessions.iter().find(|s| s.ssrc == sender_ssrc) {
                            session.inner.lock().talking = packet.header.vad_active();
                        }

                        let targets: Vec<SocketAddr> = all_sessions
                            .iter()
                            .filter(|s| s.ssrc != sender_ssrc)
                            .filter_map(|s| {
                                let inner = s.inner.lock();
                                if inner.state == SessionState::Joined && inner.audio_active {
                                    inner.udp_remote_addr
                                } else {
                                    None
                                }
                            })
                            .collect();

                        let datagram = RtpPacket::encode(packet.header, &packet.payload);
                        for addr in targets {
                            let _ = socket.send_to(&datagram, addr);
                        }
                    }
                    Ok(None) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => {}
                }
            }
        });
        self.threads.lock().push(handle);
    }

    /// Periodically evicts sessions that have gone quiet past
    /// `HEARTBEAT_TIMEOUT` (§4.7, §8 scenario 6).
    fn spawn_housekeeping(&self) {
        let sessions = self.sessions.clone();
        let running = self.running.clone();
        let events = self.events.clone();

        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_secs(2));
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                evict_timed_out(&sessions, &events);
            }
        });
        self.threads.lock().push(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping our clone lets accept()/recv_from() on held sockets time
        // out naturally within CONTROL_READ_TIMEOUT / 50ms; join everything.
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn active_peer_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.state() == SessionState::Joined)
            .count()
    }

    /// Injects one RTP frame from the server operator's own microphone into
    /// the relay (§4.9: capture callbacks route to "server fan-out" even
    /// when the capturer is the server itself, not a joined TCP session).
    pub fn broadcast_rtp(&self, header: lanvoice_protocol::rtp::RtpHeader, payload: &[u8]) {
        let targets: Vec<SocketAddr> = self
            .sessions
            .lock()
            .values()
            .filter_map(|s| {
                let inner = s.inner.lock();
                if inner.state == SessionState::Joined && inner.audio_active {
                    inner.udp_remote_addr
                } else {
                    None
                }
            })
            .collect();
        let datagram = RtpPacket::encode(header, payload);
        for addr in targets {
            let _ = self.udp_socket.send_to(&datagram, addr);
        }
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection_thread(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    sessions: Arc<Mutex<HashMap<u32, Arc<Session>>>>,
    next_client_id: Arc<AtomicU32>,
    events: EventSender,
    running: Arc<AtomicBool>,
    server_udp_port: u16,
) {
    std::thread::spawn(move || {
        let mut session: Option<Arc<Session>> = None;
        let mut client_id: Option<u32> = None;

        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let frame = match tcp::framed_read(&mut stream) {
                Ok(frame) => frame,
                Err(_) => {
                    if let Some(id) = client_id {
                        // Distinguish a genuine timeout (no data at all)
                        // from a torn-down connection by re-checking
                        // heartbeat age; if we're still within budget this
                        // was just a read timeout, keep looping.
                        if let Some(sess) = sessions.lock().get(&id) {
                            let age = sess.inner.lock().last_heartbeat.elapsed();
                            if age < HEARTBEAT_TIMEOUT && stream.peer_addr().is_ok() {
                                continue;
                            }
                        }
                    }
                    break;
                }
            };

            let header = match lanvoice_protocol::header::Header::decode(&frame) {
                Ok(h) => h,
                Err(_) => continue,
            };
            let body = &frame[lanvoice_protocol::header::HEADER_LEN..];

            match header.msg_type {
                header::MSG_HELLO => {
                    let Ok(hello) = Hello::decode_body(body) else { continue };
                    let assigned_id = if hello.client_id != 0 {
                        hello.client_id
                    } else {
                        next_client_id.fetch_add(1, Ordering::SeqCst)
                    };
                    client_id = Some(assigned_id);

                    let write_stream = stream.try_clone().expect("clone tcp stream for writes");
                    let new_session = Arc::new(Session {
                        client_id: assigned_id,
                        ssrc: assigned_id,
                        peer_tcp_addr: peer_addr,
                        inner: Mutex::new(SessionMut {
                            name: hello.client_name.clone(),
                            write_stream,
                            udp_port: None,
                            udp_remote_addr: None,
                            last_heartbeat: Instant::now(),
                            state: SessionState::HelloOk,
                            audio_active: false,
                            talking: false,
                            muted: false,
                        }),
                    });
                    sessions.lock().insert(assigned_id, new_session.clone());
                    session = Some(new_session);

                    let server_time_ms = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                    let ack = HelloAck {
                        result: 0,
                        assigned_id,
                        audio_udp_port: server_udp_port,
                        server_time_ms,
                    };
                    let _ = stream.write_all(&ack.encode());
                    tracing::info!(client_id = assigned_id, name = %hello.client_name, "client said hello");
                }

                header::MSG_JOIN_SESSION => {
                    let (Some(sess), Ok(join)) = (&session, JoinSession::decode_body(body)) else {
                        continue;
                    };

                    let udp_remote = SocketAddr::new(peer_addr.ip(), join.local_udp_port);
                    {
                        let mut inner = sess.inner.lock();
                        inner.udp_port = Some(join.local_udp_port);
                        inner.udp_remote_addr = Some(udp_remote);
                        inner.audio_active = true;
                        inner.state = SessionState::Joined;
                    }

                    let base_ts = (SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64)
                        * 48;
                    let ack = JoinAck { result: 0, ssrc: sess.ssrc, base_timestamp: base_ts };
                    let _ = stream.write_all(&ack.encode());

                    let others: Vec<PeerInfo> = sessions
                        .lock()
                        .values()
                        .filter(|s| s.client_id != sess.client_id && s.state() == SessionState::Joined)
                        .map(|s| s.peer_info())
                        .collect();
                    let list = PeerList { peers: others };
                    let _ = stream.write_all(&list.encode());

                    broadcast_except(&sessions, sess.client_id, &lanvoice_protocol::control::encode_peer_event(
                        PeerEventKind::Join,
                        &sess.peer_info(),
                    ));
                    let _ = events.send(Event::PeerJoined(sess.peer_info()));
                    tracing::info!(client_id = sess.client_id, "client joined session");
                }

                header::MSG_HEARTBEAT => {
                    let (Some(sess), Ok(hb)) = (&session, Heartbeat::decode_body(body)) else {
                        continue;
                    };
                    sess.inner.lock().last_heartbeat = Instant::now();
                    let reply = Heartbeat { client_id: hb.client_id, local_time_ms: hb.local_time_ms };
                    let _ = stream.write_all(&reply.encode());
                }

                header::MSG_AUDIO_START
                | header::MSG_AUDIO_STOP
                | header::MSG_AUDIO_MUTE
                | header::MSG_AUDIO_UNMUTE => {
                    let (Some(sess), Ok(ctrl)) = (&session, AudioControl::decode_body(body)) else {
                        continue;
                    };
                    let mut inner = sess.inner.lock();
                    match ctrl.action {
                        AudioAction::Start => inner.audio_active = true,
                        AudioAction::Stop => inner.audio_active = false,
                        AudioAction::Mute => inner.muted = true,
                        AudioAction::Unmute => inner.muted = false,
                    }
                }

                header::MSG_LEAVE_SESSION => {
                    if let Some(sess) = &session {
                        sess.inner.lock().audio_active = false;
                        sess.inner.lock().state = SessionState::Left;
                    }
                }

                _ => {
                    tracing::trace!(msg_type = header.msg_type, "unhandled control message");
                }
            }
        }

        if let Some(sess) = session {
            sess.inner.lock().state = SessionState::Closed;
            sessions.lock().remove(&sess.client_id);
            broadcast_except(
                &sessions,
                sess.client_id,
                &lanvoice_protocol::control::encode_peer_event(PeerEventKind::Leave, &sess.peer_info()),
            );
            let _ = events.send(Event::PeerLeft(sess.client_id));
            tracing::info!(client_id = sess.client_id, "client disconnected");
        }
    });
}

fn broadcast_except(sessions: &Mutex<HashMap<u32, Arc<Session>>>, originator: u32, frame: &[u8]) {
    let targets: Vec<Arc<Session>> = sessions
        .lock()
        .values()
        .filter(|s| s.client_id != originator)
        .cloned()
        .collect();
    for target in targets {
        if let Err(e) = target.send(frame) {
            tracing::warn!(client_id = target.client_id, "fan-out write failed: {}", e);
        }
    }
}

/// Scans session table for heartbeat timeouts, evicting and broadcasting
/// `PEER_LEAVE` for each (§4.7, §8 scenario 6). Polled by
/// `SessionServer::spawn_housekeeping`.
pub fn evict_timed_out(
    sessions: &Mutex<HashMap<u32, Arc<Session>>>,
    events: &EventSender,
) -> Vec<u32> {
    let timed_out: Vec<Arc<Session>> = sessions
        .lock()
        .values()
        .filter(|s| s.inner.lock().last_heartbeat.elapsed() > HEARTBEAT_TIMEOUT)
        .cloned()
        .collect();

    let mut evicted = Vec::new();
    for sess in timed_out {
        sess.inner.lock().state = SessionState::Closed;
        sessions.lock().remove(&sess.client_id);
        broadcast_except(
            sessions,
            sess.client_id,
            &lanvoice_protocol::control::encode_peer_event(PeerEventKind::Leave, &sess.peer_info()),
        );
        let _ = events.send(Event::PeerLeft(sess.client_id));
        tracing::warn!(client_id = sess.client_id, "heartbeat timeout, evicting");
        evicted.push(sess.client_id);
    }
    evicted
}
