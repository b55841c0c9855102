//! End-to-end virtual stream sockets over two live cores: listen,
//! connect, accept, ordered delivery, close propagation.

use std::time::Duration;

use emu_net::sockets::end_reason;
use emu_net::{ConnectStatus, LanNetwork, SendFlags, VirtualSockets};
use emu_shared::config::NetConfig;
use emu_shared::identity::SteamId;

fn test_config(port: u16, peer_port: u16) -> NetConfig {
    NetConfig {
        app_id: 480,
        port,
        custom_broadcasts: vec![format!("127.0.0.1:{}", peer_port)],
        broadcast_interval_ms: 100,
        heartbeat_timeout_ms: 1_000,
        user_timeout_ms: 2_000,
        ..NetConfig::default()
    }
}

async fn discover(a: &mut LanNetwork, b: &mut LanNetwork, id_a: SteamId, id_b: SteamId) {
    for _ in 0..300 {
        a.run().await;
        b.run().await;
        let a_ready = a
            .peers()
            .iter()
            .any(|p| p.ids.contains(&id_b) && p.udp_pinged && p.connected);
        let b_ready = b
            .peers()
            .iter()
            .any(|p| p.ids.contains(&id_a) && p.udp_pinged && p.connected);
        if a_ready && b_ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("discovery never converged");
}

async fn tick(
    a: &mut LanNetwork,
    vs_a: &VirtualSockets,
    b: &mut LanNetwork,
    vs_b: &VirtualSockets,
) {
    a.run().await;
    b.run().await;
    vs_a.run(a);
    vs_b.run(b);
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listen_connect_accept_handshake() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let id_a = SteamId::from_account_id(301);
    let id_b = SteamId::from_account_id(302);
    let mut b = LanNetwork::new(id_b, &test_config(43510, 43511)).await;
    let mut a = LanNetwork::new(id_a, &test_config(43510, 43510)).await;
    discover(&mut a, &mut b, id_a, id_b).await;

    let vs_a = VirtualSockets::new(&mut a, id_a);
    let vs_b = VirtualSockets::new(&mut b, id_b);

    vs_a.create_listen_socket(7, -1);
    let b_conn = vs_b.connect(&mut b, id_a, 7);
    assert_eq!(vs_b.connection_status(b_conn), Some(ConnectStatus::Connecting));
    // The connect side saw its own transition into CONNECTING.
    assert!(vs_b
        .poll_status_changes()
        .iter()
        .any(|e| e.connection == b_conn && e.status == ConnectStatus::Connecting));

    // A sees the inbound attempt in CONNECTING.
    let mut a_conn = None;
    for _ in 0..100 {
        tick(&mut a, &vs_a, &mut b, &vs_b).await;
        if let Some(ev) = vs_a
            .poll_status_changes()
            .into_iter()
            .find(|e| e.status == ConnectStatus::Connecting)
        {
            assert_eq!(ev.remote, id_b);
            a_conn = Some(ev.connection);
            break;
        }
    }
    let a_conn = a_conn.expect("no inbound attempt surfaced");

    // Accepting flips both ends to CONNECTED.
    vs_a.accept_connection(&mut a, a_conn)?;
    let mut connected = false;
    for _ in 0..100 {
        tick(&mut a, &vs_a, &mut b, &vs_b).await;
        if vs_b.connection_status(b_conn) == Some(ConnectStatus::Connected) {
            connected = true;
            break;
        }
    }
    assert!(connected, "connect side never reached CONNECTED");
    assert!(vs_b
        .poll_status_changes()
        .iter()
        .any(|e| e.connection == b_conn && e.status == ConnectStatus::Connected));

    // Reliable messages arrive in the sender's order, numbers included.
    vs_b.set_connection_user_data(b_conn, 0);
    vs_a.set_connection_user_data(a_conn, 4242);
    for i in 1..=5u8 {
        vs_b.send_message(&mut b, b_conn, vec![i], SendFlags::RELIABLE)?;
    }

    let mut got = Vec::new();
    for _ in 0..100 {
        tick(&mut a, &vs_a, &mut b, &vs_b).await;
        got.extend(vs_a.receive_on_connection(a_conn, 16)?);
        if got.len() >= 5 {
            break;
        }
    }
    assert_eq!(got.len(), 5);
    let bytes: Vec<u8> = got.iter().map(|m| m.data[0]).collect();
    assert_eq!(bytes, vec![1, 2, 3, 4, 5]);
    let numbers: Vec<u64> = got.iter().map(|m| m.message_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert!(got.iter().all(|m| m.user_data == 4242));
    assert!(got.iter().all(|m| m.remote == id_b));

    // Close on B: A's end reaches CLOSED with the reason and text, and
    // surfaces nothing further.
    assert!(vs_b.close_connection(&mut b, b_conn, end_reason::APP_GENERIC, "match over", true));
    let mut closed = false;
    for _ in 0..100 {
        tick(&mut a, &vs_a, &mut b, &vs_b).await;
        if vs_a.connection_status(a_conn) == Some(ConnectStatus::Closed) {
            closed = true;
            break;
        }
    }
    assert!(closed, "peer close never propagated");
    let ev = vs_a
        .poll_status_changes()
        .into_iter()
        .find(|e| e.connection == a_conn && e.status == ConnectStatus::Closed)
        .expect("no close event");
    assert_eq!(ev.end_reason, end_reason::APP_GENERIC);
    assert_eq!(ev.end_debug, "match over");
    assert!(vs_a.receive_on_connection(a_conn, 16)?.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_without_listener_times_out() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let id_a = SteamId::from_account_id(311);
    let id_b = SteamId::from_account_id(312);
    let mut b = LanNetwork::new(id_b, &test_config(43530, 43531)).await;
    let mut a = LanNetwork::new(id_a, &test_config(43530, 43530)).await;
    discover(&mut a, &mut b, id_a, id_b).await;

    let vs_a = VirtualSockets::new(&mut a, id_a);
    let vs_b = VirtualSockets::with_config(
        &mut b,
        id_b,
        emu_net::sockets::SocketsConfig {
            connect_timeout: Duration::from_millis(300),
            retransmit_interval: Duration::from_millis(50),
            accept_timeout: Duration::from_millis(300),
        },
    );

    // Nobody listens on port 9 at A.
    let doomed = vs_b.connect(&mut b, id_a, 9);

    let mut timed_out = false;
    for _ in 0..100 {
        tick(&mut a, &vs_a, &mut b, &vs_b).await;
        if vs_b.connection_status(doomed) == Some(ConnectStatus::TimedOut) {
            timed_out = true;
            break;
        }
    }
    assert!(timed_out, "unanswered connect never timed out");
    // And the ignored requests created nothing on A.
    assert!(vs_a.poll_status_changes().is_empty());
    Ok(())
}
