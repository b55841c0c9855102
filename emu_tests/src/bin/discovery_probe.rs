//! Standalone LAN probe.
//!
//! Usage:
//!   cargo run -p emu_tests --bin discovery_probe -- \
//!       [--id 1001] [--app-id 480] [--port 47584] [--broadcast 10.0.0.255:47584]...
//!
//! Joins the broadcast domain with the given identity, logs presence
//! edges, and prints the peer table every few seconds. Handy when
//! checking why two machines refuse to see each other.

use std::env;
use std::time::{Duration, Instant};

use emu_net::{CallbackId, LanNetwork};
use emu_shared::config::NetConfig;
use emu_shared::envelope::{LowLevelKind, Payload};
use emu_shared::identity::SteamId;
use tracing::info;

struct ProbeArgs {
    account_id: u32,
    cfg: NetConfig,
}

fn parse_args() -> ProbeArgs {
    let mut account_id = 1001u32;
    let mut cfg = NetConfig {
        app_id: 480,
        ..NetConfig::default()
    };

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--id" if i + 1 < args.len() => {
                account_id = args[i + 1].parse().unwrap_or(account_id);
                i += 2;
            }
            "--app-id" if i + 1 < args.len() => {
                cfg.app_id = args[i + 1].parse().unwrap_or(cfg.app_id);
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.port = args[i + 1].parse().unwrap_or(cfg.port);
                i += 2;
            }
            "--broadcast" if i + 1 < args.len() => {
                cfg.custom_broadcasts.push(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }

    ProbeArgs { account_id, cfg }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let identity = SteamId::from_account_id(args.account_id);
    info!(%identity, app_id = args.cfg.app_id, port = args.cfg.port, "starting probe");

    let mut net = LanNetwork::new(identity, &args.cfg).await;
    if !net.is_enabled() {
        anyhow::bail!("networking failed to initialize");
    }
    info!(udp = net.udp_port(), tcp = net.tcp_port(), "probe listening");
    for range in net.ip_ranges() {
        info!(lower = range.lower, upper = range.upper, "accepted source range");
    }

    net.register_callback(
        CallbackId::UserStatus,
        SteamId::NIL,
        Box::new(|env| {
            if let Payload::LowLevel(ref ll) = env.payload {
                match ll.kind {
                    LowLevelKind::Connect => info!(peer = env.source_id, "peer online"),
                    LowLevelKind::Disconnect => info!(peer = env.source_id, "peer offline"),
                    LowLevelKind::Heartbeat => {}
                }
            }
        }),
    );

    let mut last_report = Instant::now();
    loop {
        net.run().await;

        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = Instant::now();
            let peers = net.peers();
            info!(count = peers.len(), own_ip = %net.own_ip(), "peer table");
            for p in peers {
                info!(
                    ids = ?p.ids,
                    app_id = p.app_id,
                    tcp = ?p.tcp_endpoint,
                    udp = ?p.udp_endpoint,
                    pinged = p.udp_pinged,
                    connected = p.connected,
                    "peer"
                );
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
