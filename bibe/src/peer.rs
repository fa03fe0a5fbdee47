//! Per-peer connection management: the connect/handshake/retry state
//! machine and the socket-address-keyed peer table.

use super::*;
use caravan_bpa::cla::link::Link;
use caravan_bpa::cla::{Sink, tcp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// What the management task tracks per peer.
#[derive(Default)]
pub(crate) struct PeerState {
    pub connected: bool,
    pub link: Option<Arc<Link>>,
}

pub(crate) struct Peer {
    /// The transport address, `#<lower-eid>` suffix stripped. Key in the
    /// peer table.
    pub sock_addr: Box<str>,
    /// The EID of the node reached through this tunnel.
    pub partner_eid: Box<str>,
    /// True while a scheduled contact is open; an opportunistic peer's
    /// management task exits once its connection drops.
    pub in_contact: AtomicBool,
    /// Failed connect/handshake attempts since the last established
    /// connection.
    pub connect_attempts: AtomicU32,
    pub state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(sock_addr: &str, partner_eid: &str) -> Arc<Self> {
        Arc::new(Self {
            sock_addr: sock_addr.into(),
            partner_eid: partner_eid.into(),
            in_contact: AtomicBool::new(true),
            connect_attempts: AtomicU32::new(0),
            state: Mutex::new(PeerState::default()),
        })
    }

    /// The address this peer's links report in signaling messages.
    pub fn cla_addr(&self) -> String {
        format!("{CLA_NAME}:{}", self.sock_addr)
    }

    /// The sink this driver registers at the lower node, chosen by the
    /// partner's EID scheme.
    fn lower_sink(&self) -> &'static str {
        match caravan_eid::scheme_of(&self.partner_eid) {
            Some(caravan_eid::Scheme::Ipn) => LOWER_SINK_IPN,
            _ => LOWER_SINK_DTN,
        }
    }

    /// The connection-management loop: connect, register the tunnel sink,
    /// run the link until it drops, and repeat while in contact. Connect
    /// and handshake failures share one bounded retry budget; exhausting it
    /// terminates the peer permanently.
    pub async fn run(
        self: Arc<Self>,
        table: Arc<PeerTable>,
        retry: tcp::Retry,
        sink: Arc<dyn Sink>,
    ) {
        loop {
            let Some(mut stream) = tcp::connect_with_retry(
                &self.sock_addr,
                retry,
                &self.connect_attempts,
                || self.in_contact.load(Ordering::Acquire),
            )
            .await
            else {
                break;
            };

            // Register our sink with the lower node's application agent
            let register = aap::encode(&aap::Message::Register {
                sink: self.lower_sink().to_string(),
            });
            if let Err(e) = stream.write_all(&register).await {
                info!("bibe: handshake send to \"{}\" failed: {e}", self.sock_addr);
                drop(stream);
                let n = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if n > retry.max_attempts {
                    info!("bibe: final retry failed");
                    break;
                }
                tokio::time::sleep(retry.interval).await;
                if !self.in_contact.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }

            info!("bibe: connected successfully to \"{}\"", self.sock_addr);
            self.connect_attempts.store(0, Ordering::Relaxed);

            let (read_half, write_half) = stream.into_split();
            let link = Link::spawn(
                &self.cla_addr(),
                Box::new(read_half),
                Box::new(cla::BibeWriter::new(write_half)),
                Box::new(cla::BibeRxChain::new(sink.clone(), self.cla_addr())),
                sink.clone(),
            );

            {
                let mut state = self.state.lock().await;
                state.connected = true;
                state.link = Some(link.clone());
            }
            // Reported only after the peer state is usable, so a prompt
            // transmission request finds the TX queue
            sink.link_established(self.cla_addr());

            link.wait().await;

            {
                let mut state = self.state.lock().await;
                state.connected = false;
                state.link = None;
            }

            if !self.in_contact.load(Ordering::Acquire) {
                break;
            }
        }

        info!(
            "bibe: terminating contact link manager for \"{}\"",
            self.sock_addr
        );
        table.remove_if_same(&self.sock_addr, &self).await;
    }
}

/// The socket-address-keyed peer registry.
///
/// The table mutex is the outer lock of the driver: it is held across peer
/// lookup and link state access so a link cannot be freed between lookup
/// and enqueue, and it serializes a dying management task's self-removal
/// against a racing `start_scheduled_contact`.
#[derive(Default)]
pub(crate) struct PeerTable {
    peers: Mutex<HashMap<Box<str>, Arc<Peer>>>,
}

impl PeerTable {
    pub async fn get(&self, sock_addr: &str) -> Option<Arc<Peer>> {
        self.peers.lock().await.get(sock_addr).cloned()
    }

    /// Inserts `peer` unless an entry for the address already exists.
    pub async fn try_insert(&self, peer: Arc<Peer>) -> bool {
        match self.peers.lock().await.entry(peer.sock_addr.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(peer);
                true
            }
        }
    }

    /// Removes the entry for `sock_addr` only if it still is `peer`: a
    /// racing re-insert of the same key must not be removed by a dying
    /// management task.
    pub async fn remove_if_same(&self, sock_addr: &str, peer: &Arc<Peer>) {
        let mut peers = self.peers.lock().await;
        if let Some(current) = peers.get(sock_addr) {
            if Arc::ptr_eq(current, peer) {
                peers.remove(sock_addr);
            }
        }
    }

    /// Empties the table, returning all peers.
    pub async fn drain(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().await.drain().map(|(_, p)| p).collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Runs `f` with the table lock held; used where lookup and link access
    /// must be one atomic step.
    pub async fn with_peer<R>(
        &self,
        sock_addr: &str,
        f: impl AsyncFnOnce(&Arc<Peer>) -> R,
    ) -> Option<R> {
        let peers = self.peers.lock().await;
        let peer = peers.get(sock_addr)?;
        Some(f(peer).await)
    }
}
