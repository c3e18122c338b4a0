//! Operator CLI for `lanvoice-core` (§6 "CLI / operator surface").
//!
//! The GUI front-end is out of scope (spec.md §1); this binary is the
//! minimal readline-style command loop the spec calls for instead, wired
//! straight to [`lanvoice_core::Engine`]'s programmatic entry points. It
//! owns nothing the core doesn't already expose — mode selection, gain and
//! mute controls, manual connect, and the event stream are all here only
//! to exercise the library, the way the teacher's `main.rs` wires config
//! and logging around its own engine without holding any state of its own.

mod args;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lanvoice_core::config::EngineConfig;
use lanvoice_core::events::Event;
use lanvoice_core::Engine;

use args::{Cli, Command};

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting up logging")?;

    let cli = Cli::parse_args();

    let mut config = EngineConfig::load();
    cli.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    info!("lanvoice v{}", env!("CARGO_PKG_VERSION"));

    let engine = Arc::new(Engine::with_defaults(config.clone()));
    let events = engine.events().expect("first and only event subscriber");
    spawn_event_logger(events);

    match cli.command {
        Command::Server { name, tcp_port, udp_port, discovery_port } => {
            let name = name.unwrap_or(config.display_name.clone());
            engine
                .start_server(&name, tcp_port, udp_port, discovery_port)
                .context("starting server")?;
            info!("server running as '{}', type 'quit' to stop", name);
            run_command_loop(&engine, true)?;
            engine.stop_server();
        }
        Command::Connect { ip, tcp_port, udp_port, join } => {
            engine.connect(&ip, tcp_port, udp_port).context("connecting to server")?;
            info!("connected to {}:{}", ip, tcp_port);
            if join {
                engine.join_session().context("joining session")?;
                info!("joined session, type 'quit' to leave");
            }
            run_command_loop(&engine, false)?;
            engine.disconnect();
        }
        Command::Discover => {
            engine.start_discovery().context("starting discovery")?;
            info!("discovering servers, type 'quit' to stop");
            run_command_loop(&engine, false)?;
            engine.stop_discovery();
        }
    }

    Ok(())
}

/// Drains the engine's event channel onto the log, the same role the
/// teacher's GUI callbacks play — except typed and queue-based per §9
/// DESIGN NOTES rather than an untyped userdata callback.
fn spawn_event_logger(events: std::sync::mpsc::Receiver<Event>) {
    std::thread::spawn(move || {
        for event in events {
            match event {
                Event::ServerStarted => info!("server started"),
                Event::ServerStopped => info!("server stopped"),
                Event::Connected { server_name } => info!(%server_name, "connected"),
                Event::Disconnected => info!("disconnected"),
                Event::ServerFound(entry) => {
                    info!(name = %entry.name, ip = %entry.ip, "server found")
                }
                Event::PeerJoined(peer) => info!(name = %peer.name, "peer joined"),
                Event::PeerLeft(client_id) => info!(client_id, "peer left"),
                Event::PeerStateChanged(peer) => {
                    info!(name = %peer.name, talking = peer.talking, muted = peer.muted, "peer state changed")
                }
                Event::Error(msg) => tracing::error!(%msg, "engine error"),
            }
        }
    });
}

/// A minimal readline loop standing in for the out-of-scope GUI (§1, §6).
/// Recognizes enough commands to exercise every entry point named in §6.
fn run_command_loop(engine: &Arc<Engine>, is_server: bool) -> Result<()> {
    let stdin = io::stdin();
    print_prompt()?;
    for line in stdin.lock().lines() {
        let line = line.context("reading command")?;
        let line = line.trim();
        if line.is_empty() {
            print_prompt()?;
            continue;
        }

        let mut parts = line.split_whitespace();
        match parts.next().unwrap_or("") {
            "quit" | "exit" | "stop" => break,
            "join" if !is_server => {
                if let Err(e) = engine.join_session() {
                    tracing::warn!("join failed: {}", e);
                }
            }
            "leave" if !is_server => {
                if let Err(e) = engine.leave_session() {
                    tracing::warn!("leave failed: {}", e);
                }
            }
            "mute" => engine.set_capture_mute(true),
            "unmute" => engine.set_capture_mute(false),
            "gain" => match (parts.next(), parts.next().and_then(|v| v.parse::<f32>().ok())) {
                (Some("capture"), Some(v)) => engine.set_capture_volume(v),
                (Some("playback"), Some(v)) => engine.set_playback_volume(v),
                _ => println!("usage: gain <capture|playback> <value>"),
            },
            "stats" => print_stats(engine),
            "peers" => println!("{} discovered server(s)", engine.discovered_servers().len()),
            other => println!("unrecognized command: {other}"),
        }
        print_prompt()?;
    }
    Ok(())
}

fn print_stats(engine: &Engine) {
    let stats = engine.mixer_stats();
    println!("active streams: {}", stats.active_streams);
    for (ssrc, s) in stats.per_stream {
        println!(
            "  ssrc={ssrc} received={} lost={} late={} reordered={} loss_rate={:.3} jitter_ms={:.2}",
            s.received, s.lost, s.late, s.reordered, s.loss_rate, s.avg_jitter_ms
        );
    }
}

fn print_prompt() -> Result<()> {
    print!("lanvoice> ");
    io::stdout().flush().context("flushing stdout")
}
