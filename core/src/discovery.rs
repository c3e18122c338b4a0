//! UDP broadcast discovery (§4.2).
//!
//! The client periodically broadcasts a probe and rebuilds its directory
//! from whatever answers arrive inside each 3 s sweep window; the server
//! replies by unicast to every valid probe. Grounded on the teacher's
//! `discovery.rs`, which wraps a single service-directory concept behind a
//! small struct with explicit register/unregister lifecycle — here
//! generalized from mDNS registration to our own broadcast probe/response,
//! since the wire protocol (§6) is bespoke rather than DNS-SD.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lanvoice_protocol::discovery::{
    DiscoveryRequest, DiscoveryResponse, CAP_JITTER, CAP_OPUS, CAP_VAD,
};
use lanvoice_protocol::header::{self, Header};

use crate::events::{Event, EventSender};
use crate::transport::udp::bind_broadcast_socket;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// One entry in the client's server directory (§3). Replaced wholesale on
/// every discovery sweep rather than aged individually.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDirectoryEntry {
    pub server_id: u32,
    pub name: String,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub capability_flags: u32,
    pub current_peers: u8,
    pub max_peers: u8,
    pub version: String,
    pub last_seen: Instant,
}

impl ServerDirectoryEntry {
    pub fn supports_opus(&self) -> bool {
        self.capability_flags & CAP_OPUS != 0
    }
    pub fn supports_vad(&self) -> bool {
        self.capability_flags & CAP_VAD != 0
    }
    pub fn supports_jitter(&self) -> bool {
        self.capability_flags & CAP_JITTER != 0
    }
}

/// Client-side discovery: periodically broadcasts `DISCOVERY_REQUEST` and
/// accumulates responses into a directory that is cleared at the start of
/// every sweep (§4.2).
pub struct DiscoveryClient {
    socket: UdpSocket,
    port: Arc<Mutex<u16>>,
    client_id: u32,
    client_name: String,
    directory: Arc<Mutex<HashMap<u32, ServerDirectoryEntry>>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DiscoveryClient {
    pub fn new(client_id: u32, client_name: String, discovery_port: u16) -> std::io::Result<Self> {
        let socket = bind_broadcast_socket(0)?;
        Ok(Self {
            socket,
            port: Arc::new(Mutex::new(discovery_port)),
            client_id,
            client_name,
            directory: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn set_discovery_port(&self, port: u16) {
        *self.port.lock() = port;
    }

    pub fn directory(&self) -> Vec<ServerDirectoryEntry> {
        self.directory.lock().values().cloned().collect()
    }

    pub fn start(&self, events: EventSender) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let socket = self.socket.try_clone().expect("clone discovery socket");
        let running = self.running.clone();
        let directory = self.directory.clone();
        let client_id = self.client_id;
        let client_name = self.client_name.clone();
        let port = self.port.clone();

        let handle = std::thread::spawn(move || {
            let mut last_sweep = Instant::now() - SWEEP_INTERVAL;
            let mut seen_this_sweep: std::collections::HashSet<u32> = Default::default();
            let mut buf = [0u8; 512];

            while running.load(Ordering::SeqCst) {
                if last_sweep.elapsed() >= SWEEP_INTERVAL {
                    directory.lock().clear();
                    seen_this_sweep.clear();
                    let current_port = *port.lock();
                    let request = DiscoveryRequest {
                        client_id,
                        service_mask: CAP_OPUS | CAP_VAD | CAP_JITTER,
                        client_name: client_name.clone(),
                    };
                    let dest: SocketAddr = ([255, 255, 255, 255], current_port).into();
                    let _ = socket.send_to(&request.encode(), dest);
                    last_sweep = Instant::now();
                }

                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        if let Ok(header) = Header::decode(&buf[..len]) {
                            if header.msg_type == header::MSG_DISCOVERY_RESPONSE {
                                if let Ok(resp) = DiscoveryResponse::decode(&buf[..len]) {
                                    let first_seen = seen_this_sweep.insert(resp.server_id);
                                    let entry = ServerDirectoryEntry {
                                        server_id: resp.server_id,
                                        name: resp.server_name.clone(),
                                        ip: from.ip(),
                                        tcp_port: resp.tcp_port,
                                        udp_port: resp.audio_udp_port,
                                        capability_flags: resp.capability_flags,
                                        current_peers: resp.current_peers,
                                        max_peers: resp.max_peers,
                                        version: resp.version_str.clone(),
                                        last_seen: Instant::now(),
                                    };
                                    directory.lock().insert(resp.server_id, entry.clone());
                                    if first_seen {
                                        let _ = events.send(Event::ServerFound(entry));
                                    }
                                }
                            }
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => {}
                }
            }
        });
        *self.thread.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Server-side discovery responder: replies by unicast to every valid
/// `DISCOVERY_REQUEST` (§4.2).
pub struct DiscoveryServer {
    running: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct DiscoveryServerInfo {
    pub server_id: u32,
    pub name: String,
    pub tcp_port: u16,
    pub audio_udp_port: u16,
    pub version: String,
}

impl DiscoveryServer {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn start(
        &self,
        discovery_port: u16,
        info: DiscoveryServerInfo,
        occupancy: impl Fn() -> (u8, u8) + Send + 'static,
    ) -> std::io::Result<()> {
        let socket = bind_broadcast_socket(discovery_port)?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            while running.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        let Ok(header) = Header::decode(&buf[..len]) else { continue };
                        if header.msg_type != header::MSG_DISCOVERY_REQUEST {
                            continue;
                        }
                        if DiscoveryRequest::decode(&buf[..len]).is_err() {
                            continue;
                        }
                        let (current, max) = occupancy();
                        let response = DiscoveryResponse {
                            server_id: info.server_id,
                            tcp_port: info.tcp_port,
                            audio_udp_port: info.audio_udp_port,
                            capability_flags: CAP_OPUS | CAP_VAD | CAP_JITTER,
                            current_peers: current,
                            max_peers: max,
                            server_name: info.name.clone(),
                            version_str: info.version.clone(),
                        };
                        let _ = socket.send_to(&response.encode(), from);
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => {}
                }
            }
        });
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for DiscoveryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DiscoveryServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_entry_capability_bits() {
        let entry = ServerDirectoryEntry {
            server_id: 1,
            name: "test".into(),
            ip: [127, 0, 0, 1].into(),
            tcp_port: 5000,
            udp_port: 6000,
            capability_flags: CAP_OPUS | CAP_JITTER,
            current_peers: 0,
            max_peers: 16,
            version: "0.1".into(),
            last_seen: Instant::now(),
        };
        assert!(entry.supports_opus());
        assert!(!entry.supports_vad());
        assert!(entry.supports_jitter());
    }
}
