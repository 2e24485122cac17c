// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP transport for the BusPro gateway.
//!
//! The transport owns the single UDP socket, tracks the gateway peer and
//! implements the NAT guard: in bridged container networks the UDP source
//! of gateway frames can be rewritten to the container's default gateway
//! address, which must not be adopted as the send target.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::codec::{self, Telegram};
use crate::config::GatewayConfig;
use crate::error::ProtocolError;

/// Abstraction over the outbound side of the bus.
///
/// The send scheduler writes through this trait so tests can observe
/// dispatched telegrams without a socket.
pub trait BusSink: Send + Sync {
    /// Sends one telegram, best-effort.
    ///
    /// # Errors
    ///
    /// Returns an error when no socket is bound or the datagram could not
    /// be handed to the kernel.
    fn send(&self, telegram: &Telegram) -> Result<(), ProtocolError>;
}

/// A telegram received from the bus along with its raw frame and peer.
#[derive(Debug, Clone)]
pub struct RxTelegram {
    pub telegram: Telegram,
    pub raw: Vec<u8>,
    pub peer: SocketAddr,
}

#[derive(Debug)]
struct PeerState {
    /// Destination for outbound frames. Host may be adopted from RX,
    /// the port always stays the configured gateway port.
    tx: SocketAddr,
    /// Last address a frame was received from.
    rx: Option<SocketAddr>,
}

/// The UDP endpoint of the bridge.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    local_ip: Ipv4Addr,
    gateway_port: u16,
    peer: Mutex<PeerState>,
    /// Container default gateway; RX hosts equal to it are never adopted.
    default_gateway: Option<IpAddr>,
    trace_frames: bool,
}

impl UdpTransport {
    /// Binds the socket and resolves the configured gateway.
    ///
    /// A bind failure is logged, not fatal: the bridge still starts so the
    /// admin surface stays reachable, and commands fail with
    /// [`ProtocolError::TransportNotReady`] until restart.
    pub async fn bind(config: &GatewayConfig, trace_frames: bool) -> Self {
        let bind_port = config.bind_port();
        let socket = match UdpSocket::bind(("0.0.0.0", bind_port)).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!(port = bind_port, error = %e, "UDP bind failed");
                None
            }
        };

        let tx_host = resolve_host(&config.host)
            .unwrap_or_else(|| IpAddr::V4(Ipv4Addr::LOCALHOST));
        let local_ip = configured_local_ip(config).unwrap_or_else(|| detect_local_ip(&config.host));

        tracing::info!(
            gateway = %tx_host,
            port = config.port,
            local_ip = %local_ip,
            "BusPro transport ready"
        );

        Self {
            socket,
            local_ip,
            gateway_port: config.port,
            peer: Mutex::new(PeerState {
                tx: SocketAddr::new(tx_host, config.port),
                rx: None,
            }),
            default_gateway: read_default_gateway(),
            trace_frames,
        }
    }

    /// Whether the socket bound successfully.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.socket.is_some()
    }

    /// Current send target.
    #[must_use]
    pub fn peer_tx(&self) -> SocketAddr {
        self.peer.lock().tx
    }

    /// Last receive peer, if any frame arrived yet.
    #[must_use]
    pub fn peer_rx(&self) -> Option<SocketAddr> {
        self.peer.lock().rx
    }

    /// Local IPv4 stamped into outgoing frame headers.
    #[must_use]
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Records an RX peer and, when it passes the NAT guard, adopts its
    /// host as the send target (keeping the configured port: some gateways
    /// emit from an ephemeral source port).
    pub fn note_rx(&self, from: SocketAddr) {
        let mut peer = self.peer.lock();
        peer.rx = Some(from);

        if let Some(gw) = self.default_gateway {
            if from.ip() == gw {
                // Looks NATed; keep the configured target.
                return;
            }
        }
        let adopted = SocketAddr::new(from.ip(), self.gateway_port);
        if peer.tx != adopted {
            tracing::info!(old = %peer.tx, new = %adopted, "adopting gateway send target from RX");
            peer.tx = adopted;
        }
    }

    /// Spawns the receive loop, forwarding decoded telegrams to `out`.
    ///
    /// The loop never blocks on downstream work; a full channel means the
    /// process is wedged and dropping is the only sane option.
    pub fn spawn_recv_loop(
        self: &Arc<Self>,
        out: mpsc::UnboundedSender<RxTelegram>,
    ) -> Option<JoinHandle<()>> {
        if self.socket.is_none() {
            return None;
        }
        let transport = Arc::clone(self);
        Some(tokio::spawn(async move {
            let Some(socket) = transport.socket.as_ref() else {
                return;
            };
            let mut buf = vec![0u8; 2048];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP recv failed");
                        continue;
                    }
                };
                let data = &buf[..len];
                if transport.trace_frames {
                    tracing::debug!(
                        from = %from,
                        len,
                        hex = %hex_prefix(data, 48),
                        "UDP RX"
                    );
                }
                match codec::decode(data) {
                    Ok(telegram) => {
                        transport.note_rx(from);
                        let _ = out.send(RxTelegram {
                            telegram,
                            raw: data.to_vec(),
                            peer: from,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(
                            from = %from,
                            error = %e,
                            opcode = codec::raw_opcode(data).map(|op| format!("raw:0x{op:04x}")),
                            "dropping undecodable frame"
                        );
                    }
                }
            }
        }))
    }
}

impl BusSink for UdpTransport {
    fn send(&self, telegram: &Telegram) -> Result<(), ProtocolError> {
        let socket = self.socket.as_ref().ok_or(ProtocolError::TransportNotReady)?;
        let target = self.peer_tx();
        let wire = codec::encode(telegram, self.local_ip);
        match socket.try_send_to(&wire, target) {
            Ok(_) => {
                tracing::trace!(target = %target, opcode = %telegram.opcode, "UDP TX");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Kernel buffer full; UDP is best-effort, polling recovers.
                tracing::debug!(target = %target, "UDP TX would block, dropping");
                Ok(())
            }
            Err(e) => Err(ProtocolError::UdpSend(e)),
        }
    }
}

fn configured_local_ip(config: &GatewayConfig) -> Option<Ipv4Addr> {
    let raw = config.local_ip.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            tracing::warn!(local_ip = raw, "ignoring invalid local_ip override");
            None
        }
    }
}

/// Lets the OS pick the outgoing interface toward the gateway; no packet
/// is sent by connecting a UDP socket.
fn detect_local_ip(gateway_host: &str) -> Ipv4Addr {
    let probe = || -> Option<Ipv4Addr> {
        let sock = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
        sock.connect((gateway_host, 1)).ok()?;
        match sock.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    };
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Some(ip);
    }
    // Hostname: resolve synchronously once at startup.
    std::net::ToSocketAddrs::to_socket_addrs(&(host, 0))
        .ok()?
        .next()
        .map(|a| a.ip())
}

/// Reads the IPv4 default gateway from `/proc/net/route`, best effort.
fn read_default_gateway() -> Option<IpAddr> {
    let content = std::fs::read_to_string("/proc/net/route").ok()?;
    for line in content.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _iface = fields.next()?;
        let dest = fields.next()?;
        let gateway = fields.next()?;
        if dest != "00000000" {
            continue;
        }
        let raw = u32::from_str_radix(gateway, 16).ok()?;
        // /proc stores the address little-endian.
        return Some(IpAddr::V4(Ipv4Addr::from(raw.swap_bytes())));
    }
    None
}

fn hex_prefix(data: &[u8], max: usize) -> String {
    data.iter()
        .take(max)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BusAddress;

    /// Per-test port so parallel tests never collide on a bind.
    fn test_port() -> u16 {
        use std::sync::atomic::{AtomicU16, Ordering};
        static PORT_COUNTER: AtomicU16 = AtomicU16::new(26850);
        PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    fn test_config(port: u16) -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port,
            local_udp_port: None,
            local_ip: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn bind_and_send() {
        let port = test_port();
        let transport = UdpTransport::bind(&test_config(port), false).await;
        assert!(transport.ready());
        // The configured target is this test's own port, so the datagram
        // loops back to the bound socket.
        let telegram = Telegram::read_status_of_channels(BusAddress::new(1, 1));
        transport.send(&telegram).unwrap();
    }

    #[tokio::test]
    async fn note_rx_adopts_host_but_keeps_port() {
        let port = test_port();
        let transport = UdpTransport::bind(&test_config(port), false).await;
        let from: SocketAddr = "10.0.0.7:49152".parse().unwrap();
        transport.note_rx(from);
        assert_eq!(transport.peer_rx(), Some(from));
        assert_eq!(transport.peer_tx().ip(), from.ip());
        assert_eq!(transport.peer_tx().port(), port);
    }

    #[tokio::test]
    async fn nat_guard_rejects_default_gateway() {
        let mut transport = UdpTransport::bind(&test_config(test_port()), false).await;
        transport.default_gateway = Some("172.30.32.1".parse().unwrap());
        let before = transport.peer_tx();
        transport.note_rx("172.30.32.1:6000".parse().unwrap());
        assert_eq!(transport.peer_tx(), before);
        // RX is still recorded for diagnostics.
        assert!(transport.peer_rx().is_some());
    }

    #[test]
    fn detect_local_ip_handles_unreachable_host() {
        // Must not panic, whatever the environment provides.
        let _ = detect_local_ip("203.0.113.1");
    }
}
