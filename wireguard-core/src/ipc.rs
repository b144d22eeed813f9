//! The textual configuration protocol (spec §4.8): line-oriented
//! `key=value` requests terminated by an empty line, transport-agnostic
//! over any `BufRead`/`Write` pair so the orchestrator can bind it to a
//! Unix socket (the `demos` binary) or an in-memory pipe in tests,
//! mirroring the pack's UAPI parser (`telio-wg::uapi`).

use std::fmt::Write as _;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use ipnet::IpNet;
use x25519_dalek::PublicKey;

use crate::device::Device;
use crate::error::{DeviceError, IpcError};

fn parse_hex32(s: &str) -> Result<[u8; 32], IpcError> {
    if s.len() != 64 {
        return Err(IpcError::InvalidValue("key", s.to_string()));
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let byte = std::str::from_utf8(chunk)
            .ok()
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .ok_or_else(|| IpcError::InvalidValue("key", s.to_string()))?;
        out[i] = byte;
    }
    Ok(out)
}

fn hex32(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// A single `set=1` transaction: device-level keys followed by zero or
/// more `public_key=...`-introduced peer blocks.
struct PeerBlock {
    public_key: PublicKey,
    remove: bool,
    update_only: bool,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    persistent_keepalive: Option<Option<Duration>>,
    replace_allowed_ips: bool,
    allowed_ips: Vec<IpNet>,
}

impl PeerBlock {
    fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            remove: false,
            update_only: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }
}

/// Applies a `set=1` request body to `device`.
pub fn apply_set(device: &Device, body: &str) -> Result<(), IpcError> {
    let mut private_key = None;
    let mut listen_port = None;
    let mut fwmark = None;
    let mut replace_peers = false;
    let mut peers: Vec<PeerBlock> = Vec::new();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or(IpcError::Malformed("line missing `=`"))?;

        if key == "public_key" {
            let bytes = parse_hex32(value)?;
            peers.push(PeerBlock::new(PublicKey::from(bytes)));
            continue;
        }

        if let Some(peer) = peers.last_mut() {
            apply_peer_line(peer, key, value)?;
            continue;
        }

        match key {
            "private_key" => private_key = Some(parse_hex32(value)?),
            "listen_port" => {
                listen_port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| IpcError::InvalidValue("listen_port", value.to_string()))?,
                )
            }
            "fwmark" => {
                let mark = value
                    .parse::<u32>()
                    .map_err(|_| IpcError::InvalidValue("fwmark", value.to_string()))?;
                fwmark = Some(mark);
            }
            "replace_peers" => replace_peers = value == "true",
            "set" | "get" => {}
            other => return Err(IpcError::InvalidValue("key", other.to_string())),
        }
    }

    if replace_peers || private_key.is_some() || listen_port.is_some() || fwmark.is_some() {
        device.reconfigure(private_key, listen_port, fwmark, replace_peers);
    }

    for block in peers {
        apply_peer_block(device, block)?;
    }

    Ok(())
}

fn apply_peer_line(peer: &mut PeerBlock, key: &str, value: &str) -> Result<(), IpcError> {
    match key {
        "remove" => peer.remove = value == "true",
        "update_only" => peer.update_only = value == "true",
        "preshared_key" => {
            peer.preshared_key = Some(if value.is_empty() {
                [0u8; 32]
            } else {
                parse_hex32(value)?
            });
        }
        "endpoint" => {
            let addr = value
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next())
                .ok_or_else(|| IpcError::InvalidValue("endpoint", value.to_string()))?;
            peer.endpoint = Some(addr);
        }
        "persistent_keepalive_interval" => {
            let secs = value
                .parse::<u64>()
                .map_err(|_| IpcError::InvalidValue("persistent_keepalive_interval", value.to_string()))?;
            peer.persistent_keepalive = Some(if secs == 0 { None } else { Some(Duration::from_secs(secs)) });
        }
        "replace_allowed_ips" => peer.replace_allowed_ips = value == "true",
        "allowed_ip" => {
            let net: IpNet = value
                .parse()
                .map_err(|_| IpcError::InvalidValue("allowed_ip", value.to_string()))?;
            peer.allowed_ips.push(net);
        }
        "protocol_version" => {
            if value != "1" {
                return Err(IpcError::InvalidValue("protocol_version", value.to_string()));
            }
        }
        other => return Err(IpcError::InvalidValue("key", other.to_string())),
    }
    Ok(())
}

fn apply_peer_block(device: &Device, block: PeerBlock) -> Result<(), IpcError> {
    if block.remove {
        return device
            .remove_peer(&block.public_key)
            .or_else(|e| if matches!(e, DeviceError::UnknownPeer) { Ok(()) } else { Err(e) })
            .map_err(IpcError::from);
    }

    let id = match device.peer_id_for(&block.public_key) {
        Some(id) => id,
        None if block.update_only => return Err(DeviceError::UnknownPeer.into()),
        None => device.add_peer(block.public_key, block.preshared_key)?,
    };

    device.update_peer(id, |peer| {
        if let Some(psk) = block.preshared_key {
            peer.config.preshared_key = psk;
        }
        if let Some(endpoint) = block.endpoint {
            peer.endpoint = Some(endpoint);
        }
        if let Some(interval) = block.persistent_keepalive {
            peer.persistent_keepalive = interval;
            peer.timers.persistent_keepalive = interval;
        }
    });

    if block.replace_allowed_ips || !block.allowed_ips.is_empty() {
        let nets = if block.replace_allowed_ips {
            block.allowed_ips
        } else {
            let mut existing = device.peer_allowed_ips(id);
            existing.extend(block.allowed_ips);
            existing
        };
        device.set_peer_allowed_ips(id, nets);
    }

    Ok(())
}

/// Renders a `get=1` response: device keys, then each peer's fields in
/// the order the real protocol uses, then a trailing `errno=0` and
/// blank line.
pub fn render_get(device: &Device) -> String {
    let mut out = String::new();
    device.with_inner(|inner| {
        let _ = writeln!(out, "private_key={}", hex32(&inner.static_secret.to_bytes()));
        if let Some(port) = inner.listen_port {
            let _ = writeln!(out, "listen_port={port}");
        }
        if let Some(mark) = inner.fwmark {
            let _ = writeln!(out, "fwmark={mark}");
        }
        for peer in inner.peers.iter().flatten() {
            let _ = writeln!(out, "public_key={}", hex32(peer.config.key.as_bytes()));
            if peer.config.preshared_key != [0u8; 32] {
                let _ = writeln!(out, "preshared_key={}", hex32(&peer.config.preshared_key));
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={endpoint}");
            }
            let keepalive_secs = peer.persistent_keepalive.map(|d| d.as_secs()).unwrap_or(0);
            let _ = writeln!(out, "persistent_keepalive_interval={keepalive_secs}");
            for net in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={net}");
            }
            let last_handshake_secs = peer
                .last_handshake_completed
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0);
            let _ = writeln!(out, "last_handshake_time_sec={last_handshake_secs}");
            let _ = writeln!(out, "rx_bytes={}", peer.counters.rx_bytes);
            let _ = writeln!(out, "tx_bytes={}", peer.counters.tx_bytes);
        }
    });
    out.push_str("errno=0\n\n");
    out
}

/// Renders an error response for a failed `set=1`/`get=1` request.
pub fn render_error(err: &IpcError) -> String {
    format!("errno={}\n\n", err.errno())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use rand::rngs::OsRng;
    use x25519_dalek::StaticSecret;

    fn dummy_device() -> Device {
        Device::new(DeviceConfig {
            private_key: StaticSecret::random_from_rng(OsRng),
            listen_port: None,
            fwmark: None,
        })
    }

    #[test]
    fn set_then_get_round_trips_a_peer() {
        let device = dummy_device();
        let peer_sk = StaticSecret::random_from_rng(OsRng);
        let peer_pk = PublicKey::from(&peer_sk);
        let body = format!(
            "public_key={}\nendpoint=127.0.0.1:51820\npersistent_keepalive_interval=25\nallowed_ip=10.0.0.2/32\n",
            hex32(peer_pk.as_bytes())
        );
        apply_set(&device, &body).unwrap();

        let rendered = render_get(&device);
        assert!(rendered.contains(&format!("public_key={}", hex32(peer_pk.as_bytes()))));
        assert!(rendered.contains("endpoint=127.0.0.1:51820"));
        assert!(rendered.contains("persistent_keepalive_interval=25"));
        assert!(rendered.contains("allowed_ip=10.0.0.2/32"));
        assert!(rendered.ends_with("errno=0\n\n"));
    }

    #[test]
    fn remove_on_unknown_peer_is_a_no_op() {
        let device = dummy_device();
        let peer_sk = StaticSecret::random_from_rng(OsRng);
        let peer_pk = PublicKey::from(&peer_sk);
        let body = format!("public_key={}\nremove=true\n", hex32(peer_pk.as_bytes()));
        assert!(apply_set(&device, &body).is_ok());
    }

    #[test]
    fn update_only_on_unknown_peer_is_an_error() {
        let device = dummy_device();
        let peer_sk = StaticSecret::random_from_rng(OsRng);
        let peer_pk = PublicKey::from(&peer_sk);
        let body = format!("public_key={}\nupdate_only=true\n", hex32(peer_pk.as_bytes()));
        let err = apply_set(&device, &body).unwrap_err();
        assert_eq!(err.errno(), 2);
    }

    #[test]
    fn malformed_line_is_rejected() {
        let device = dummy_device();
        let err = apply_set(&device, "not_a_key_value_line\n").unwrap_err();
        assert_eq!(err.errno(), 22);
    }
}
