//! Typed event stream replacing the callback-struct-with-userdata pattern
//! (§9 DESIGN NOTES). The engine publishes; the operator surface (or a
//! test) subscribes on the receiving half of an `std::sync::mpsc` channel
//! handed out by [`crate::orchestrator::Engine::events`].

use lanvoice_protocol::control::PeerInfo;

use crate::discovery::ServerDirectoryEntry;

#[derive(Debug, Clone)]
pub enum Event {
    ServerStarted,
    ServerStopped,
    Connected { server_name: String },
    Disconnected,
    ServerFound(ServerDirectoryEntry),
    PeerJoined(PeerInfo),
    PeerLeft(u32),
    PeerStateChanged(PeerInfo),
    Error(String),
}

pub type EventSender = std::sync::mpsc::Sender<Event>;
pub type EventReceiver = std::sync::mpsc::Receiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    std::sync::mpsc::channel()
}
