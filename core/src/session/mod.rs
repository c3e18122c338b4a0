//! Session state machines (§3 `Session`/`Peer`, §4.7, §4.8).
//!
//! `server` owns the server-side per-client session table and its TCP/UDP
//! fan-out; `client` owns the client-side TCP control connection, ingest
//! and playback pump. Both reuse [`lanvoice_protocol::control::PeerInfo`] as
//! the wire-shaped peer record rather than introducing a parallel domain
//! type, since §3's `Peer` and §6's `PeerInfo` carry identical fields.

pub mod client;
pub mod server;

pub use client::SessionClient;
pub use server::SessionServer;
