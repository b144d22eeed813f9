//! The two platform collaborators the core data plane consumes but
//! never implements itself (spec §1, §6): a TUN interface that
//! delivers/accepts IP frames, and a UDP bind that delivers/accepts
//! datagrams tagged with a source/destination endpoint. Real OS TUN
//! creation is a non-goal of the core crate; this crate ships the
//! trait boundary plus a `std::net::UdpSocket`-backed `Bind` (which
//! *is* in scope — spec §4.6 calls it "the UDP bind") and an
//! in-process `ChannelTun` used by tests and the `demos` binary's
//! loopback mode.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Mutex;

pub trait Tun: Send + Sync {
    /// Read one IP frame (v4 or v6, distinguishable by the first
    /// nibble) into `buf`, returning its length. Blocks until a frame
    /// is available.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one IP frame.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn mtu(&self) -> usize;
}

pub trait Bind: Send + Sync {
    /// Send `buf` to `endpoint`.
    fn send_to(&self, buf: &[u8], endpoint: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, blocking until one arrives.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_port(&self) -> io::Result<u16>;
}

/// A UDP bind over a real OS socket. WireGuard listens on a single
/// port shared by IPv4 and IPv6, so the orchestrator opens one of
/// these per address family when dual-stack is requested.
pub struct UdpBind {
    socket: UdpSocket,
}

impl UdpBind {
    /// `port == 0` requests an ephemeral port, matching spec §6's
    /// bind interface ("0 for ephemeral").
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(false)?;
        Ok(Self { socket })
    }
}

impl Bind for UdpBind {
    fn send_to(&self, buf: &[u8], endpoint: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, endpoint)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelTunError {
    #[error("peer end of the channel tun was dropped")]
    Closed,
}

/// An in-process "TUN" backed by a pair of channels instead of a real
/// kernel device. Used by integration tests (spec §8's end-to-end
/// scenarios) and by the `demos` binary's loopback mode, where two
/// `Device`s run in the same process and exchange frames directly
/// instead of through an OS network stack.
pub struct ChannelTun {
    outbound: Mutex<Receiver<Vec<u8>>>,
    inbound: Sender<Vec<u8>>,
    mtu: usize,
}

impl ChannelTun {
    pub fn pair(mtu: usize) -> (Self, Self) {
        let (tx_a, rx_a) = std::sync::mpsc::channel();
        let (tx_b, rx_b) = std::sync::mpsc::channel();
        (
            ChannelTun {
                outbound: Mutex::new(rx_a),
                inbound: tx_b,
                mtu,
            },
            ChannelTun {
                outbound: Mutex::new(rx_b),
                inbound: tx_a,
                mtu,
            },
        )
    }
}

impl Tun for ChannelTun {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.outbound.lock().unwrap().recv() {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::BrokenPipe, ChannelTunError::Closed)),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inbound
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, ChannelTunError::Closed))?;
        Ok(buf.len())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl ChannelTun {
    /// Non-blocking peek used by tests that want to assert "no more
    /// frames arrived" without hanging on `read`.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, TryRecvError> {
        match self.outbound.lock().unwrap().try_recv() {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(Some(n))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_tun_round_trips_a_frame() {
        let (a, b) = ChannelTun::pair(1500);
        a.write(b"hello").unwrap();
        let mut buf = [0u8; 1500];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn udp_bind_ephemeral_port_is_nonzero() {
        let bind = UdpBind::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(bind.local_port().unwrap(), 0);
    }
}
