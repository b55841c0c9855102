//! Full-socket discovery tests: two cores on one host find each other,
//! exchange transports, and notice each other dying.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use emu_net::{CallbackId, LanNetwork};
use emu_shared::config::NetConfig;
use emu_shared::envelope::{LowLevelKind, Payload};
use emu_shared::identity::SteamId;

fn test_config(port: u16, peer_port: u16) -> NetConfig {
    NetConfig {
        app_id: 480,
        port,
        // Loopback stands in for the LAN broadcast domain.
        custom_broadcasts: vec![format!("127.0.0.1:{}", peer_port)],
        broadcast_interval_ms: 100,
        heartbeat_timeout_ms: 1_000,
        user_timeout_ms: 1_200,
        ..NetConfig::default()
    }
}

/// Collects (identity, online) presence edges.
fn watch_presence(net: &mut LanNetwork) -> Arc<Mutex<Vec<(u64, bool)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    net.register_callback(
        CallbackId::UserStatus,
        SteamId::NIL,
        Box::new(move |env| {
            if let Payload::LowLevel(ref ll) = env.payload {
                let online = match ll.kind {
                    LowLevelKind::Connect => true,
                    LowLevelKind::Disconnect => false,
                    LowLevelKind::Heartbeat => return,
                };
                sink.lock().unwrap().push((env.source_id, online));
            }
        }),
    );
    seen
}

fn mutually_discovered(a: &LanNetwork, b: &LanNetwork, id_a: SteamId, id_b: SteamId) -> bool {
    let a_sees_b = a
        .peers()
        .iter()
        .any(|p| p.ids.contains(&id_b) && p.udp_pinged && p.connected);
    let b_sees_a = b
        .peers()
        .iter()
        .any(|p| p.ids.contains(&id_a) && p.udp_pinged && p.connected);
    a_sees_b && b_sees_a
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_cores_discover_each_other() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let id_a = SteamId::from_account_id(101);
    let id_b = SteamId::from_account_id(102);

    // B grabs the base port, A scans past it; each aims its custom
    // broadcast at the other's bound port.
    let mut b = LanNetwork::new(id_b, &test_config(43210, 43211)).await;
    assert!(b.is_enabled());
    let mut a = LanNetwork::new(id_a, &test_config(43210, 43210)).await;
    assert!(a.is_enabled());
    assert_ne!(a.udp_port(), b.udp_port());

    let a_presence = watch_presence(&mut a);
    let b_presence = watch_presence(&mut b);

    let mut found = false;
    for _ in 0..300 {
        a.run().await;
        b.run().await;
        if mutually_discovered(&a, &b, id_a, id_b) {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(found, "peers never mutually discovered each other");

    // Both sides fired an online edge for the other's identity.
    assert!(a_presence
        .lock()
        .unwrap()
        .contains(&(id_b.as_u64(), true)));
    assert!(b_presence
        .lock()
        .unwrap()
        .contains(&(id_a.as_u64(), true)));

    // The discovered records carry the advertised TCP endpoints.
    let a_view = a.peers();
    let rec = a_view.iter().find(|p| p.ids.contains(&id_b)).unwrap();
    assert_eq!(rec.tcp_endpoint.unwrap().port(), b.tcp_port());
    assert_eq!(rec.app_id, 480);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_peer_is_swept_after_user_timeout() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let id_a = SteamId::from_account_id(111);
    let id_b = SteamId::from_account_id(112);

    let mut b = LanNetwork::new(id_b, &test_config(43230, 43231)).await;
    let mut a = LanNetwork::new(id_a, &test_config(43230, 43230)).await;
    let a_presence = watch_presence(&mut a);

    let mut found = false;
    for _ in 0..300 {
        a.run().await;
        b.run().await;
        if mutually_discovered(&a, &b, id_a, id_b) {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(found, "discovery never converged");

    // Kill B outright; its sockets close with it.
    drop(b);

    let mut gone = false;
    for _ in 0..400 {
        a.run().await;
        if !a.peers().iter().any(|p| p.ids.contains(&id_b)) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone, "dead peer record never swept");
    assert!(a_presence
        .lock()
        .unwrap()
        .contains(&(id_b.as_u64(), false)));

    Ok(())
}
