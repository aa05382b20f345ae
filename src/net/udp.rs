//! Plain UDP transport
//!
//! Each datagram carries one bincode-encoded [`Datagram`]. A peer takes a
//! slot with `Connect`, and loses it on `Close` or after a stretch of
//! silence. There is no retransmission: vital messages are sent once like
//! everything else.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::game::constants::net::{CONNECTION_TIMEOUT_SECS, MAX_DATAGRAM_SIZE};
use crate::net::framing::check_datagram_size;
use crate::net::protocol;
use crate::net::transport::{ClientId, SendFlags, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    Connect,
    Message { vital: bool, payload: Vec<u8> },
    KeepAlive,
    Close { reason: String },
}

#[derive(Debug, Clone, Copy)]
struct Peer {
    addr: SocketAddr,
    last_recv: Instant,
}

pub struct UdpTransport {
    socket: UdpSocket,
    peers: Vec<Option<Peer>>,
    by_addr: FxHashMap<SocketAddr, ClientId>,
    /// Datagrams picked up while waiting
    pending: Vec<(SocketAddr, Vec<u8>)>,
    timeout: Duration,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr, max_clients: usize) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        info!("UDP transport listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            peers: vec![None; max_clients],
            by_addr: FxHashMap::default(),
            pending: Vec::new(),
            timeout: Duration::from_secs(CONNECTION_TIMEOUT_SECS),
            buf: vec![0; MAX_DATAGRAM_SIZE + 1],
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    fn send_datagram(&self, addr: SocketAddr, datagram: &Datagram) -> Result<(), TransportError> {
        let bytes = protocol::encode(datagram)?;
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    fn release(&mut self, client: ClientId) -> Option<Peer> {
        let peer = self.peers.get_mut(client)?.take()?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8], now: Instant, events: &mut Vec<TransportEvent>) {
        if let Err(e) = check_datagram_size(bytes.len()) {
            debug!("dropping datagram from {}: {}", addr, e);
            return;
        }
        let datagram: Datagram = match protocol::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("undecodable datagram from {}: {}", addr, e);
                return;
            }
        };

        let Some(&client) = self.by_addr.get(&addr) else {
            if datagram == Datagram::Connect {
                self.accept(addr, now, events);
            }
            return;
        };
        if let Some(peer) = self.peers[client].as_mut() {
            peer.last_recv = now;
        }

        match datagram {
            Datagram::Connect => events.push(TransportEvent::Rejoined { client }),
            Datagram::Message { vital, payload } => events.push(TransportEvent::Packet {
                client,
                data: payload,
                vital,
            }),
            Datagram::KeepAlive => {}
            Datagram::Close { reason } => {
                self.release(client);
                events.push(TransportEvent::Disconnected { client, reason });
            }
        }
    }

    fn accept(&mut self, addr: SocketAddr, now: Instant, events: &mut Vec<TransportEvent>) {
        let Some(client) = self.peers.iter().position(Option::is_none) else {
            let close = Datagram::Close {
                reason: "This server is full".to_string(),
            };
            if let Err(e) = self.send_datagram(addr, &close) {
                debug!("failed to refuse {}: {}", addr, e);
            }
            return;
        };
        self.peers[client] = Some(Peer { addr, last_recv: now });
        self.by_addr.insert(addr, client);
        events.push(TransportEvent::Connected { client, addr });
    }

    fn expire(&mut self, now: Instant, events: &mut Vec<TransportEvent>) {
        for client in 0..self.peers.len() {
            let Some(peer) = self.peers[client] else {
                continue;
            };
            if now.saturating_duration_since(peer.last_recv) < self.timeout {
                continue;
            }
            self.release(client);
            let reason = "Timeout".to_string();
            let _ = self.send_datagram(peer.addr, &Datagram::Close { reason: reason.clone() });
            events.push(TransportEvent::Disconnected { client, reason });
        }
    }
}

impl Transport for UdpTransport {
    fn poll(&mut self) -> Vec<TransportEvent> {
        let now = Instant::now();
        let mut events = Vec::new();

        for (addr, bytes) in std::mem::take(&mut self.pending) {
            self.handle_datagram(addr, &bytes, now, &mut events);
        }

        if let Err(e) = self.socket.set_nonblocking(true) {
            warn!("failed to switch socket to non-blocking: {}", e);
            return events;
        }
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((len, addr)) => {
                    let bytes = self.buf[..len].to_vec();
                    self.handle_datagram(addr, &bytes, now, &mut events);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                // ICMP port unreachable from a vanished peer surfaces here on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    break;
                }
            }
        }

        self.expire(now, &mut events);
        events
    }

    fn send(&mut self, client: ClientId, payload: &[u8], flags: SendFlags) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(client)
            .copied()
            .flatten()
            .ok_or(TransportError::NotConnected(client))?;
        let datagram = Datagram::Message {
            vital: flags.vital,
            payload: payload.to_vec(),
        };
        self.send_datagram(peer.addr, &datagram)
    }

    fn drop_client(&mut self, client: ClientId, reason: &str) {
        if let Some(peer) = self.release(client) {
            let close = Datagram::Close {
                reason: reason.to_string(),
            };
            if let Err(e) = self.send_datagram(peer.addr, &close) {
                debug!("failed to notify {} of drop: {}", peer.addr, e);
            }
        }
    }

    fn wait(&mut self, timeout: Duration) {
        let timeout = timeout.max(Duration::from_micros(1));
        if self.socket.set_nonblocking(false).is_err() || self.socket.set_read_timeout(Some(timeout)).is_err() {
            return;
        }
        if let Ok((len, addr)) = self.socket.recv_from(&mut self.buf) {
            self.pending.push((addr, self.buf[..len].to_vec()));
        }
    }
}
