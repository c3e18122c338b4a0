//! Command-line argument parsing (§6 "CLI / operator surface").
//!
//! Grounded on the pack's `turn-server` binary, which likewise reaches for
//! `clap`'s derive API for a headless operator surface — the teacher's own
//! binary has no CLI flags of its own (see SPEC_FULL.md "CLI parsing").

use clap::{Parser, Subcommand};

use lanvoice_core::config::EngineConfig;
use lanvoice_protocol::{control, discovery, rtp};

#[derive(Parser)]
#[command(name = "lanvoice", version, about = "LAN voice conferencing relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a conference server (§4.7, §6 `start_server`).
    Server {
        /// Display name advertised over discovery.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = control::DEFAULT_TCP_PORT)]
        tcp_port: u16,
        #[arg(long, default_value_t = rtp::DEFAULT_AUDIO_PORT)]
        udp_port: u16,
        #[arg(long, default_value_t = discovery::DEFAULT_DISCOVERY_PORT)]
        discovery_port: u16,
    },
    /// Connect to a known server by address (§4.8, §6 `connect`).
    Connect {
        ip: String,
        #[arg(long, default_value_t = control::DEFAULT_TCP_PORT)]
        tcp_port: u16,
        #[arg(long, default_value_t = rtp::DEFAULT_AUDIO_PORT)]
        udp_port: u16,
        /// Join the session immediately after connecting.
        #[arg(long)]
        join: bool,
    },
    /// Browse the LAN for servers without connecting (§4.2, §6).
    Discover,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Applies per-subcommand flag overrides onto a loaded [`EngineConfig`]
    /// (§6: the operator surface overrides individual fields rather than
    /// re-parsing the file, per `core::config`'s own doc comment).
    pub fn apply_overrides(&self, config: &mut EngineConfig) {
        if let Command::Server { discovery_port, .. } = &self.command {
            config.discovery_port = *discovery_port;
        }
    }
}
