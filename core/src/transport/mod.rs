//! Socket helpers (§4.3): UDP broadcast/audio sockets, TCP listen/connect,
//! and the length-framed TCP reader. Grounded on the teacher's
//! `network_audio::rtp::RtpReceiver::new` (socket2 for `SO_REUSEADDR` plus
//! multicast join) and on `examples/original_source/src/network.c`'s
//! `Network_Create*`/`Network_TcpRecvPacket` for the exact socket-option and
//! framing contract this module reproduces over `std::net`.

pub mod tcp;
pub mod udp;

pub use tcp::{connect, framed_read, listen, FramedReader};
pub use udp::{bind_audio_socket, bind_broadcast_socket, recv_rtp, send_rtp};
