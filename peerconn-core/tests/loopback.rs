//! End-to-end scenarios over loopback sockets: one process plays both the listening and
//! the dialing side of a connection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use peerconn_core::{
    Channel, Config, EventKind, MessageKind, PeerConn, PeerDescriptor, PeerEvent,
};
use tokio::sync::broadcast::{self, error::RecvError};

const WAIT: Duration = Duration::from_secs(10);

fn config(download_dir: &Path) -> Config {
    Config {
        download_dir: download_dir.to_path_buf(),
        ..Config::default()
    }
}

fn start(config: Config) -> (PeerConn, broadcast::Receiver<PeerEvent>) {
    let (pc, dispatcher) = PeerConn::new(config);
    let events = pc.subscribe();
    tokio::spawn(dispatcher.run());
    (pc, events)
}

/// Wait for the first event matching `pred`, skipping everything else.
async fn wait_for<F>(events: &mut broadcast::Receiver<PeerEvent>, mut pred: F) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

fn history_of(kind: MessageKind, id: &'static str) -> impl FnMut(&PeerEvent) -> bool {
    move |ev| ev.id == id && matches!(&ev.kind, EventKind::History(m) if m.kind == kind)
}

/// Listener "srv" and dialer "cli" with both channels up.
async fn connected_pair(pc: &PeerConn, events: &mut broadcast::Receiver<PeerEvent>) {
    pc.create_peer_socket(Some("srv")).unwrap();
    pc.set_peersocket("srv", PeerDescriptor::new("", "127.0.0.1", 0, 0))
        .unwrap();
    pc.set_server("srv").unwrap();
    let ev = wait_for(events, |ev| {
        ev.id == "srv" && matches!(ev.kind, EventKind::Listening { .. })
    })
    .await;
    let EventKind::Listening {
        message_port,
        file_port,
    } = ev.kind
    else {
        unreachable!()
    };
    assert_ne!(message_port, 0);
    assert_ne!(file_port, 0);

    pc.create_peer_socket(Some("cli")).unwrap();
    pc.set_peersocket(
        "cli",
        PeerDescriptor::new("", "127.0.0.1", message_port, file_port),
    )
    .unwrap();
    pc.connect("cli").unwrap();
    wait_until(|| pc.list_active().len() == 2).await;
    let (srv, cli) = (pc.get("srv").unwrap(), pc.get("cli").unwrap());
    wait_until(|| {
        srv.count(MessageKind::ConnectionEstablished) == 2
            && cli.count(MessageKind::ConnectionEstablished) == 2
    })
    .await;
    assert_eq!(pc.list_server().len(), 1);
    assert_eq!(pc.list_client().len(), 1);
}

fn only_file_in(dir: &Path) -> PathBuf {
    let day = std::fs::read_dir(dir).unwrap().next().unwrap().unwrap().path();
    let mut files: Vec<_> = std::fs::read_dir(day)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    files.remove(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_message_and_close() {
    let tmp = tempfile::tempdir().unwrap();
    let (pc, mut events) = start(config(tmp.path()));
    connected_pair(&pc, &mut events).await;

    let srv = pc.get("srv").unwrap();
    let cli = pc.get("cli").unwrap();
    assert_eq!(srv.cipher_key(), cli.cipher_key());
    assert!(srv.cipher_key().is_some());
    assert!(srv.has_cipher_suite() && cli.has_cipher_suite());
    let seen_as = cli.observed_address().unwrap();
    assert!(seen_as.starts_with("127.0.0.1:"), "{seen_as}");
    assert!(srv.observed_address().is_some());

    pc.send_message("cli", "hello").unwrap();
    let ev = wait_for(&mut events, history_of(MessageKind::Peer, "srv")).await;
    let EventKind::History(m) = ev.kind else {
        unreachable!()
    };
    assert_eq!(m.content, "hello");
    wait_until(|| cli.count(MessageKind::SelfSent) == 1).await;
    assert_eq!(srv.unread(), 1);
    srv.mark_read();
    assert_eq!(srv.unread(), 0);

    pc.close("cli").unwrap();
    wait_for(&mut events, |ev| ev.id == "cli" && ev.kind == EventKind::Closed).await;
    assert!(pc.get("cli").is_none());
    assert_eq!(cli.count(MessageKind::ConnectionLost), 2);

    wait_until(|| srv.count(MessageKind::ConnectionLost) == 2).await;
    assert!(!srv.message_connected());
    assert!(!srv.file_connected());
    // Exactly one loss per channel, even after the dust settles.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(srv.count(MessageKind::ConnectionLost), 2);

    pc.exit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_arrives_intact() {
    let tmp = tempfile::tempdir().unwrap();
    let downloads = tmp.path().join("downloads");
    let (pc, mut events) = start(config(&downloads));
    connected_pair(&pc, &mut events).await;

    let src = tmp.path().join("payload.bin");
    let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    pc.send_file("cli", &src).unwrap();
    let ev = wait_for(&mut events, history_of(MessageKind::FileNotifyEnd, "srv")).await;
    let EventKind::History(m) = ev.kind else {
        unreachable!()
    };
    assert!(m.content.contains("completely received"), "{}", m.content);

    let received = only_file_in(&downloads);
    assert_eq!(received.file_name().unwrap(), "payload.bin");
    assert_eq!(std::fs::read(received).unwrap(), data);

    let cli = pc.get("cli").unwrap();
    wait_until(|| !cli.in_file_transfer()).await;
    assert_eq!(cli.file_percentage(), 100);

    pc.exit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_run_in_order_and_warnings_collapse() {
    let tmp = tempfile::tempdir().unwrap();
    let (pc, mut events) = start(config(tmp.path()));
    pc.create_peer_socket(Some("lonely")).unwrap();

    pc.send_message("lonely", "one").unwrap();
    pc.send_message("lonely", "two").unwrap();
    pc.close("ghost").unwrap();
    let ev = wait_for(&mut events, |ev| ev.id == "ghost").await;
    assert!(matches!(ev.kind, EventKind::Rejected(_)));

    let lonely = pc.get("lonely").unwrap();
    assert_eq!(lonely.count(MessageKind::SystemWarning), 1);
    assert_eq!(lonely.history()[0].content, "No connection");
    assert_eq!(lonely.count(MessageKind::SelfSent), 0);

    pc.exit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dialer_cannot_listen() {
    let tmp = tempfile::tempdir().unwrap();
    let (pc, mut events) = start(config(tmp.path()));
    connected_pair(&pc, &mut events).await;

    pc.set_server("cli").unwrap();
    pc.connect("srv").unwrap();
    pc.close("ghost").unwrap();
    wait_for(&mut events, |ev| ev.id == "ghost").await;

    assert_eq!(pc.get("cli").unwrap().count(MessageKind::SystemWarning), 1);
    assert_eq!(pc.get("srv").unwrap().count(MessageKind::SystemWarning), 1);
    assert_eq!(pc.list_active().len(), 2);

    pc.exit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_during_send_stops_transfer() {
    let tmp = tempfile::tempdir().unwrap();
    let downloads = tmp.path().join("downloads");
    let (pc, mut events) = start(config(&downloads));
    connected_pair(&pc, &mut events).await;

    let src = tmp.path().join("big.bin");
    std::fs::write(&src, vec![7u8; 32 * 1024 * 1024]).unwrap();
    pc.send_file("cli", &src).unwrap();
    wait_for(&mut events, history_of(MessageKind::FileNotifyStart, "cli")).await;

    pc.close("cli").unwrap();
    wait_for(&mut events, |ev| ev.id == "cli" && ev.kind == EventKind::Closed).await;
    let srv = pc.get("srv").unwrap();
    wait_until(|| srv.count(MessageKind::ConnectionLost) == 2).await;
    wait_until(|| !srv.in_file_transfer()).await;

    pc.exit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_events_follow_state() {
    let tmp = tempfile::tempdir().unwrap();
    let (pc, mut events) = start(config(tmp.path()));
    let mut up = pc.subscribe();
    connected_pair(&pc, &mut events).await;

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let ev = wait_for(&mut up, |ev| {
            ev.id == "cli" && matches!(ev.kind, EventKind::ChannelUp(_))
        })
        .await;
        if let EventKind::ChannelUp(channel) = ev.kind {
            assert!(!seen.contains(&channel));
            seen.push(channel);
        }
    }
    assert!(seen.contains(&Channel::Message) && seen.contains(&Channel::File));

    pc.close("cli").unwrap();
    let mut down = Vec::new();
    while down.len() < 2 {
        let ev = wait_for(&mut up, |ev| {
            ev.id == "cli" && matches!(ev.kind, EventKind::ChannelDown(_))
        })
        .await;
        if let EventKind::ChannelDown(channel) = ev.kind {
            down.push(channel);
        }
    }
    pc.exit().unwrap();
}

// Default test runtime is current-thread, like the one `PeerConn::spawn` builds.
#[tokio::test]
async fn cancel_right_after_send_stops_the_transfer() {
    let tmp = tempfile::tempdir().unwrap();
    let (pc, mut events) = start(config(&tmp.path().join("downloads")));
    connected_pair(&pc, &mut events).await;

    let src = tmp.path().join("big.bin");
    std::fs::write(&src, vec![3u8; 8 * 1024 * 1024]).unwrap();
    pc.send_file("cli", &src).unwrap();
    pc.cancel_file("cli").unwrap();

    let ev = wait_for(&mut events, history_of(MessageKind::FileNotifyEnd, "cli")).await;
    let EventKind::History(m) = ev.kind else {
        unreachable!()
    };
    assert!(m.content.contains("cancelled"), "{}", m.content);
    let cli = pc.get("cli").unwrap();
    assert_eq!(cli.count(MessageKind::SystemWarning), 0);
    assert!(!cli.in_file_transfer());

    pc.exit().unwrap();
}
