//! Example orchestrator binary: wires a `Device` to a real UDP socket
//! and a loopback `ChannelTun` (real OS TUN creation is out of scope,
//! mirroring the teacher's own `examples/tun.rs`), runs the three
//! worker loops (UDP receive, TUN receive, timer tick) on plain
//! threads, and serves the textual IPC protocol over a Unix socket.

use std::io::{BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use clap::Parser;
use ipnet::IpNet;
use wireguard_core::{Device, DeviceConfig, InboundOutcome, OutboundOutcome};
use wireguard_tun::{Bind, ChannelTun, Tun, UdpBind};
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Parser)]
struct Args {
    /// Base64 private key; a fresh one is generated and printed if omitted.
    #[arg(long)]
    private_key: Option<String>,

    #[arg(long, default_value_t = 51820)]
    listen_port: u16,

    /// Base64 public key of a peer to add at startup.
    #[arg(long, requires = "peer_endpoint")]
    peer_key: Option<String>,

    #[arg(long)]
    peer_endpoint: Option<SocketAddr>,

    #[arg(long = "peer_allowed_ip")]
    peer_allowed_ips: Vec<String>,

    /// Unix socket path for the IPC configuration protocol.
    #[arg(long)]
    ipc_socket: Option<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let private_key = match &args.private_key {
        Some(b64) => {
            let mut bytes = [0u8; 32];
            Base64::decode(b64, &mut bytes).expect("private key must be valid base64 of 32 bytes");
            StaticSecret::from(bytes)
        }
        None => {
            let sk = StaticSecret::random_from_rng(rand::rngs::OsRng);
            log::info!("generated private key: {}", Base64::encode_string(sk.as_bytes()));
            sk
        }
    };
    log::info!(
        "public key: {}",
        Base64::encode_string(PublicKey::from(&private_key).as_bytes())
    );

    let device = Arc::new(Device::new(DeviceConfig {
        private_key,
        listen_port: Some(args.listen_port),
        fwmark: None,
    }));

    let mut pending_initiation = None;
    if let Some(peer_b64) = &args.peer_key {
        let mut bytes = [0u8; 32];
        Base64::decode(peer_b64, &mut bytes).expect("peer key must be valid base64 of 32 bytes");
        let peer_key = PublicKey::from(bytes);
        let id = device.add_peer(peer_key, None).expect("failed to add peer");
        let nets: Vec<IpNet> = args
            .peer_allowed_ips
            .iter()
            .map(|s| s.parse().expect("peer_allowed_ip must be a CIDR"))
            .collect();
        device.set_peer_allowed_ips(id, nets);
        if let Some(endpoint) = args.peer_endpoint {
            device.set_peer_endpoint(id, endpoint);
        }
        pending_initiation = Some(id);
    }

    let bind: Arc<dyn Bind> = Arc::new(UdpBind::bind(SocketAddr::from(([0, 0, 0, 0], args.listen_port))).expect("failed to bind UDP socket"));
    let (tun, sink) = ChannelTun::pair(1500);
    let tun: Arc<dyn Tun> = Arc::new(tun);
    device.up(bind.clone(), tun.clone()).expect("device already up");

    if let Some(id) = pending_initiation {
        if let Some((datagram, to)) = device.initiate_handshake(id) {
            let _ = bind.send_to(&datagram, to);
        }
    }

    let udp_device = device.clone();
    let udp_bind = bind.clone();
    let udp_tun = tun.clone();
    let udp_thread = std::thread::spawn(move || udp_recv_loop(udp_device, udp_bind, udp_tun));

    let tun_device = device.clone();
    let tun_bind = bind.clone();
    let tun_thread = std::thread::spawn(move || tun_recv_loop(tun_device, tun_bind, tun));

    // Drains frames the peer's TUN side would otherwise consume; real
    // OS TUN delivery is out of scope for this example.
    std::thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while sink.read(&mut buf).is_ok() {}
    });

    let timer_device = device.clone();
    let timer_bind = bind.clone();
    let timer_thread = std::thread::spawn(move || timer_loop(timer_device, timer_bind));

    if let Some(path) = args.ipc_socket {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("failed to bind IPC socket");
        serve_ipc(device, listener);
    } else {
        let _ = udp_thread.join();
        let _ = tun_thread.join();
        let _ = timer_thread.join();
    }
}

fn udp_recv_loop(device: Arc<Device>, bind: Arc<dyn Bind>, tun: Arc<dyn Tun>) {
    let mut buf = [0u8; 2048];
    loop {
        let (n, from) = match bind.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("udp recv failed: {e}");
                continue;
            }
        };
        match device.process_inbound_datagram(&buf[..n], from) {
            InboundOutcome::Reply { datagram, to } => {
                let _ = bind.send_to(&datagram, to);
            }
            InboundOutcome::DeliverToTun { frame } => {
                let _ = tun.write(&frame);
            }
            InboundOutcome::Keepalive | InboundOutcome::Drop => {}
        }
    }
}

fn tun_recv_loop(device: Arc<Device>, bind: Arc<dyn Bind>, tun: Arc<dyn Tun>) {
    let mut buf = [0u8; 2048];
    loop {
        let n = match tun.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("tun read failed: {e}");
                return;
            }
        };
        match device.process_outbound_frame(buf[..n].to_vec()) {
            OutboundOutcome::Send { datagram, to } => {
                let _ = bind.send_to(&datagram, to);
            }
            OutboundOutcome::NeedsHandshake(id) => {
                if let Some((datagram, to)) = device.initiate_handshake(id) {
                    let _ = bind.send_to(&datagram, to);
                }
            }
            OutboundOutcome::Queued | OutboundOutcome::Unroutable => {}
        }
    }
}

fn timer_loop(device: Arc<Device>, bind: Arc<dyn Bind>) {
    loop {
        std::thread::sleep(Duration::from_millis(250));
        for (id, event) in device.poll_timers() {
            log::trace!("peer {id}: {event:?}");
            match event {
                wireguard_core::TimerEvent::SendHandshakeInitiation
                | wireguard_core::TimerEvent::RetryHandshake => {
                    if let Some((datagram, to)) = device.initiate_handshake(id) {
                        let _ = bind.send_to(&datagram, to);
                    }
                }
                wireguard_core::TimerEvent::SendKeepalive => {
                    if let Some((datagram, to)) = device.send_keepalive(id) {
                        let _ = bind.send_to(&datagram, to);
                    }
                }
                wireguard_core::TimerEvent::AbandonHandshake | wireguard_core::TimerEvent::ZeroKeys => {}
            }
        }
    }
}

/// Serves the line-oriented IPC protocol (spec §4.8) over accepted
/// Unix connections: a request is `set=1`/`get=1` followed by
/// `key=value` lines and a blank line.
fn serve_ipc(device: Arc<Device>, listener: UnixListener) {
    for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        let device = device.clone();
        std::thread::spawn(move || {
            let reader_stream = stream.try_clone().expect("failed to clone IPC stream");
            let mut reader = BufReader::new(reader_stream);
            let mut body = String::new();
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
                body.push_str(&line);
            }
            let response = if body.starts_with("get=1") {
                device.render_ipc_get()
            } else {
                match device.apply_ipc_set(&body) {
                    Ok(()) => "errno=0\n\n".to_string(),
                    Err(e) => format!("errno={}\n\n", e.errno()),
                }
            };
            let _ = stream.write_all(response.as_bytes());
        });
    }
}
