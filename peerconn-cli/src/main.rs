// PeerConn terminal host: one connection, commands on stdin, events on stdout.

mod args;

use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use clap::Parser;
use peerconn_core::{EventKind, MessageKind, PeerConn, PeerDescriptor, PeerEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use args::{Args, Mode};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = peerconn_core::config::load();
    if let Some(name) = &args.name {
        config.display_name = name.clone();
    }
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    tracing::debug!(?config, "configuration loaded");

    let (pc, dispatcher) = PeerConn::spawn(config)?;
    let events = pc.subscribe();
    std::thread::Builder::new()
        .name("peerconn-events".into())
        .spawn(move || print_events(events))?;

    let id = match &args.mode {
        Mode::Listen {
            message_port,
            file_port,
            address,
            id,
        } => {
            let address = address
                .clone()
                .unwrap_or_else(|| local_ipv4().to_string());
            let id = pc.create_peer_socket(id.as_deref())?;
            pc.set_peersocket(
                &id,
                PeerDescriptor::new("", address, *message_port, *file_port),
            )?;
            pc.set_server(&id)?;
            id
        }
        Mode::Dial {
            address,
            message_port,
            file_port,
            id,
        } => {
            let id = pc.create_peer_socket(id.as_deref())?;
            pc.set_peersocket(
                &id,
                PeerDescriptor::new("", address.as_str(), *message_port, *file_port),
            )?;
            pc.connect(&id)?;
            id
        }
    };
    println!("connection {id}; type a message, or /file PATH, /cancel, /close, /list, /quit");

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if !run_line(&pc, &id, line.trim_end())? {
            break;
        }
    }

    pc.exit()?;
    match dispatcher.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("dispatcher thread panicked"),
    }
    Ok(())
}

/// Execute one stdin line. Returns false when the host should stop.
fn run_line(pc: &PeerConn, id: &str, line: &str) -> anyhow::Result<bool> {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return Ok(false),
        ("/file", path) if !path.trim().is_empty() => pc.send_file(id, path.trim())?,
        ("/file", _) => eprintln!("usage: /file PATH"),
        ("/cancel", _) => pc.cancel_file(id)?,
        ("/close", _) => pc.close(id)?,
        ("/list", _) => list(pc),
        _ if line.is_empty() => {}
        _ => pc.send_message(id, line)?,
    }
    Ok(true)
}

fn list(pc: &PeerConn) {
    let servers = pc.list_server();
    let clients = pc.list_client();
    if servers.is_empty() && clients.is_empty() {
        println!("no connections");
    }
    for (label, conns) in [("server", servers), ("client", clients)] {
        for c in conns {
            let peer = c
                .peerdata()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let seen_as = c.observed_address().unwrap_or_else(|| "-".to_string());
            print!("{label} {} peer={peer} seen-as={seen_as} ", c.id());
            println!(
                "message={:?} file={:?} encrypted={} unread={}",
                c.channel_state(peerconn_core::Channel::Message),
                c.channel_state(peerconn_core::Channel::File),
                c.has_cipher_suite(),
                c.unread()
            );
        }
    }
}

fn print_events(mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        let ev = match events.blocking_recv() {
            Ok(ev) => ev,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match ev.kind {
            EventKind::History(m) => {
                let time = m.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
                match m.kind {
                    MessageKind::SelfSent | MessageKind::Peer => {
                        println!("[{time}] {}: {}", m.sender, m.content)
                    }
                    _ => println!("[{time}] * {}", m.content),
                }
            }
            EventKind::Listening {
                message_port,
                file_port,
            } => println!(
                "[{}] listening on message port {message_port}, file port {file_port}",
                ev.id
            ),
            EventKind::FileProgress(p) if p % 10 == 0 => println!("[{}] {p}%", ev.id),
            EventKind::Rejected(reason) => eprintln!("[{}] rejected: {reason}", ev.id),
            EventKind::Closed => println!("[{}] closed", ev.id),
            EventKind::FileProgress(_) | EventKind::ChannelUp(_) | EventKind::ChannelDown(_) => {}
        }
    }
}

/// This host's outbound IPv4 address. Connecting a UDP socket only consults the routing table.
fn local_ipv4() -> IpAddr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| s.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).map(|_| s))
        .and_then(|s| s.local_addr());
    match routed {
        Ok(addr) => addr.ip(),
        Err(e) => {
            tracing::warn!(error = %e, "no route for local address lookup; using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
