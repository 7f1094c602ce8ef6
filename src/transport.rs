//! # Mail Transports
//!
//! Two [`Transport`] implementations feeding the node's event queue:
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`MemoryNetwork`] / [`MemoryTransport`] | in-process clusters for tests and simulations |
//! | [`UdpTransport`] | the binary; one datagram per mail |
//!
//! Both run every mail through the crate codec, so what a node receives is
//! always what `decode_mail` accepted.
//!
//! ## Events
//!
//! ```text
//! transport ──► NetEvent ──► node dispatcher
//!   Mail          requests → handlers, replies → sessions
//!   Connected     first mail from a peer
//!   PeerInvalid   undecodable mail from a known sender
//!   CommError     send failure
//!   Unreachable   destination not reachable
//!   PortClosed    receive side is gone
//!   Unsent        requests that never left; their sessions are released
//! ```

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::identity::{Identity, PeerRecord};
use crate::messages::{
    Body, Channel, Envelope, decode_mail, deserialize_bounded, encode_mail, serialize_bounded,
};
use crate::protocols::Transport;
use crate::session::SessionId;

/// Largest UDP payload we send (IPv4 maximum).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Senders remembered for first-contact detection.
/// SECURITY: Bounded so spoofed identities cannot grow the table.
const KNOWN_SENDERS: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

#[derive(Debug, Clone)]
pub enum NetEvent {
    Mail { from: PeerRecord, mail: Vec<Envelope> },
    Connected(PeerRecord),
    PeerInvalid(PeerRecord),
    CommError { peer: PeerRecord, reason: String },
    Unreachable(PeerRecord),
    PortClosed,
    Unsent { to: PeerRecord, sessions: Vec<SessionId> },
}

pub type EventSender = mpsc::UnboundedSender<NetEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NetEvent>;

fn request_sessions(mail: &[Envelope]) -> Vec<SessionId> {
    mail.iter()
        .filter(|e| matches!(e.body, Body::Request(_)))
        .map(|e| e.session)
        .collect()
}

// ============================================================================
// In-memory network
// ============================================================================

struct Attached {
    record: PeerRecord,
    events: EventSender,
}

/// Shared medium connecting [`MemoryTransport`]s.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<Identity, Attached>,
    blocked: DashMap<(Identity, Identity), ()>,
    faulty: DashMap<(Identity, Identity), ()>,
    seen: DashMap<(Identity, Identity), ()>,
    delivered: AtomicUsize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node and return its transport and event queue.
    pub fn attach(self: &Arc<Self>, record: PeerRecord) -> (Arc<MemoryTransport>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(
            record.identity,
            Attached {
                record: record.clone(),
                events: tx.clone(),
            },
        );
        let transport = Arc::new(MemoryTransport {
            network: self.clone(),
            me: record,
            events: tx,
        });
        (transport, rx)
    }

    /// Detach a node; mail addressed to it becomes unsent.
    pub fn detach(&self, identity: &Identity) {
        if let Some((_, attached)) = self.nodes.remove(identity) {
            let _ = attached.events.send(NetEvent::PortClosed);
        }
    }

    /// Drop all mail between `a` and `b`, in both directions.
    pub fn partition(&self, a: Identity, b: Identity) {
        self.blocked.insert((a, b), ());
        self.blocked.insert((b, a), ());
    }

    pub fn heal(&self, a: Identity, b: Identity) {
        self.blocked.remove(&(a, b));
        self.blocked.remove(&(b, a));
        self.faulty.remove(&(a, b));
    }

    /// Sends from `from` to `to` fail with a communication error.
    pub fn fault(&self, from: Identity, to: Identity) {
        self.faulty.insert((from, to), ());
    }

    fn is_faulty(&self, from: &Identity, to: &Identity) -> bool {
        self.faulty.contains_key(&(*from, *to))
    }

    /// Mails successfully handed to a receiver.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: &PeerRecord, to: &Identity, bytes: &[u8]) -> bool {
        if self.blocked.contains_key(&(from.identity, *to)) {
            return false;
        }
        let Some(target) = self.nodes.get(to) else {
            return false;
        };
        let event = match decode_mail(bytes) {
            Ok(mail) => NetEvent::Mail {
                from: from.clone(),
                mail,
            },
            Err(e) => {
                debug!(from = %from.identity.short(), error = %e, "undecodable mail");
                NetEvent::PeerInvalid(from.clone())
            }
        };
        if self.seen.insert((*to, from.identity), ()).is_none() {
            let _ = target.events.send(NetEvent::Connected(from.clone()));
        }
        let ok = target.events.send(event).is_ok();
        if ok {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        trace!(to = %target.record.identity.short(), ok, "memory mail delivered");
        ok
    }

    /// Hand raw bytes to `to` as if `from` sent them.
    pub fn inject_raw(&self, from: &PeerRecord, to: &Identity, bytes: &[u8]) -> bool {
        self.deliver(from, to, bytes)
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    me: PeerRecord,
    events: EventSender,
}

impl MemoryTransport {
    pub fn record(&self) -> &PeerRecord {
        &self.me
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_mail(&self, to: &PeerRecord, channel: Channel, mail: Vec<Envelope>) {
        let bytes = match encode_mail(&mail) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode mail");
                let _ = self.events.send(NetEvent::Unsent {
                    to: to.clone(),
                    sessions: request_sessions(&mail),
                });
                return;
            }
        };
        trace!(to = %to.identity.short(), ?channel, bytes = bytes.len(), "memory mail");
        if self.network.is_faulty(&self.me.identity, &to.identity) {
            let _ = self.events.send(NetEvent::CommError {
                peer: to.clone(),
                reason: "link fault".to_string(),
            });
            let _ = self.events.send(NetEvent::Unsent {
                to: to.clone(),
                sessions: request_sessions(&mail),
            });
            return;
        }
        if !self.network.deliver(&self.me, &to.identity, &bytes) {
            let _ = self.events.send(NetEvent::Unreachable(to.clone()));
            let _ = self.events.send(NetEvent::Unsent {
                to: to.clone(),
                sessions: request_sessions(&mail),
            });
        }
    }
}

// ============================================================================
// UDP transport
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Datagram {
    sender: Identity,
    channel: Channel,
    mail: Vec<u8>,
}

/// Plain datagram transport. No encryption, no fragmentation: a mail must fit
/// in one datagram.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    me: PeerRecord,
    events: EventSender,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    pub async fn bind(identity: Identity, addr: SocketAddr) -> Result<(Arc<Self>, EventReceiver)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", addr))?;
        let local = socket.local_addr().context("failed to read local address")?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_loop(socket.clone(), tx.clone()));
        debug!(%local, "udp transport bound");
        Ok((
            Arc::new(Self {
                socket,
                me: PeerRecord::new(identity, local),
                events: tx,
                receiver,
            }),
            rx,
        ))
    }

    pub fn record(&self) -> &PeerRecord {
        &self.me
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.me.endpoint
    }

    fn unsent(&self, to: &PeerRecord, mail: &[Envelope]) {
        let _ = self.events.send(NetEvent::Unsent {
            to: to.clone(),
            sessions: request_sessions(mail),
        });
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_mail(&self, to: &PeerRecord, channel: Channel, mail: Vec<Envelope>) {
        let frame = encode_mail(&mail).and_then(|payload| {
            serialize_bounded(&Datagram {
                sender: self.me.identity,
                channel,
                mail: payload,
            })
        });
        let bytes = match frame {
            Ok(bytes) if bytes.len() <= MAX_DATAGRAM_SIZE => bytes,
            Ok(bytes) => {
                warn!(size = bytes.len(), max = MAX_DATAGRAM_SIZE, "mail exceeds datagram size");
                self.unsent(to, &mail);
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to encode mail");
                self.unsent(to, &mail);
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&bytes, to.endpoint).await {
            debug!(to = %to.endpoint, error = %e, "udp send failed");
            let _ = self.events.send(NetEvent::CommError {
                peer: to.clone(),
                reason: e.to_string(),
            });
            self.unsent(to, &mail);
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, events: EventSender) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut known: LruCache<Identity, SocketAddr> = LruCache::new(KNOWN_SENDERS);
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "udp receive failed, closing port");
                let _ = events.send(NetEvent::PortClosed);
                return;
            }
        };

        let datagram: Datagram = match deserialize_bounded(&buf[..len]) {
            Ok(datagram) => datagram,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed datagram");
                continue;
            }
        };
        if !datagram.sender.is_valid() {
            trace!(%from, "dropping datagram with an invalid sender key");
            continue;
        }
        let sender = PeerRecord::new(datagram.sender, from);

        if known.get(&sender.identity) != Some(&from) {
            known.put(sender.identity, from);
            if events.send(NetEvent::Connected(sender.clone())).is_err() {
                return;
            }
        }

        let event = match decode_mail(&datagram.mail) {
            Ok(mail) => NetEvent::Mail { from: sender, mail },
            Err(e) => {
                debug!(peer = %sender.identity.short(), error = %e, "undecodable mail");
                NetEvent::PeerInvalid(sender)
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Outcome, Reply, Request};
    use crate::address::Address;
    use crate::identity::Keypair;

    fn record(seed: u8) -> PeerRecord {
        PeerRecord::new(
            Identity::from_bytes([seed; 32]),
            format!("127.0.0.1:{}", 9000 + seed as u16).parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn memory_mail_is_delivered_with_first_contact() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.attach(record(1));
        let (_b, mut b_rx) = network.attach(record(2));

        let mail = vec![Envelope::request(7, Request::PeerAccess { target: Address::new(1) })];
        a.send_mail(&record(2), Channel::Control, mail.clone()).await;

        assert!(matches!(b_rx.recv().await, Some(NetEvent::Connected(p)) if p == record(1)));
        match b_rx.recv().await {
            Some(NetEvent::Mail { from, mail: got }) => {
                assert_eq!(from, record(1));
                assert_eq!(got, mail);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn undeliverable_requests_are_reported_unsent() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.attach(record(1));

        let mail = vec![
            Envelope::request(3, Request::PeerAccess { target: Address::new(1) }),
            Envelope::reply(4, Reply::Status(Outcome::Success)),
        ];
        a.send_mail(&record(9), Channel::Control, mail).await;

        assert!(matches!(a_rx.recv().await, Some(NetEvent::Unreachable(_))));
        match a_rx.recv().await {
            Some(NetEvent::Unsent { sessions, .. }) => assert_eq!(sessions, vec![3]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn partitioned_nodes_cannot_talk() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.attach(record(1));
        let (_b, _b_rx) = network.attach(record(2));
        network.partition(record(1).identity, record(2).identity);

        a.send_mail(&record(2), Channel::Control, vec![]).await;
        assert!(matches!(a_rx.recv().await, Some(NetEvent::Unreachable(_))));

        network.heal(record(1).identity, record(2).identity);
        a.send_mail(&record(2), Channel::Control, vec![]).await;
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn garbage_marks_sender_invalid() {
        let network = MemoryNetwork::new();
        let (_b, mut b_rx) = network.attach(record(2));
        network.inject_raw(&record(1), &record(2).identity, &[0xFF, 0xFF, 0xFF]);

        assert!(matches!(b_rx.recv().await, Some(NetEvent::Connected(_))));
        assert!(matches!(b_rx.recv().await, Some(NetEvent::PeerInvalid(p)) if p == record(1)));
    }

    #[tokio::test]
    async fn udp_round_trip() {
        let a_id = Keypair::generate().identity();
        let (a, _a_rx) = UdpTransport::bind(a_id, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(Keypair::generate().identity(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let mail = vec![Envelope::reply(11, Reply::Demand(true))];
        a.send_mail(b.record(), Channel::Control, mail.clone()).await;

        assert!(matches!(b_rx.recv().await, Some(NetEvent::Connected(p)) if p.identity == a_id));
        match b_rx.recv().await {
            Some(NetEvent::Mail { from, mail: got }) => {
                assert_eq!(from.endpoint, a.local_addr());
                assert_eq!(got, mail);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn udp_drops_datagrams_from_invalid_keys() {
        let (b, mut b_rx) = UdpTransport::bind(Keypair::generate().identity(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let forged = serialize_bounded(&Datagram {
            sender: Identity::from_bytes([0u8; 32]),
            channel: Channel::Control,
            mail: encode_mail(&[]).unwrap(),
        })
        .unwrap();
        raw.send_to(&forged, b.local_addr()).await.unwrap();

        let honest_id = Keypair::generate().identity();
        let honest = serialize_bounded(&Datagram {
            sender: honest_id,
            channel: Channel::Control,
            mail: encode_mail(&[]).unwrap(),
        })
        .unwrap();
        raw.send_to(&honest, b.local_addr()).await.unwrap();

        // The forged datagram left no trace; the first event is the honest sender.
        assert!(matches!(b_rx.recv().await, Some(NetEvent::Connected(p)) if p.identity == honest_id));
    }

    #[tokio::test]
    async fn faulty_link_reports_comm_error_and_unsent() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = network.attach(record(1));
        let (_b, _b_rx) = network.attach(record(2));
        network.fault(record(1).identity, record(2).identity);

        let mail = vec![Envelope::request(5, Request::PeerAccess { target: Address::new(1) })];
        a.send_mail(&record(2), Channel::Control, mail).await;

        assert!(matches!(a_rx.recv().await, Some(NetEvent::CommError { peer, .. }) if peer == record(2)));
        assert!(matches!(a_rx.recv().await, Some(NetEvent::Unsent { sessions, .. }) if sessions == vec![5]));
        assert_eq!(network.delivered(), 0);
    }
}
