//! The propagation server: listener, outbound peers, and fan-out.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use chain_store::service::ChainHandle;
use chain_types::transaction::Transaction;
use chain_types::TransactionSet;

use crate::connection::{run_inbound, run_outbound, PropConfig};
use crate::message::WireError;

pub(crate) struct ConnectionEntry {
    gossip: mpsc::UnboundedSender<TransactionSet>,
}

pub(crate) struct ServerInner {
    pub(crate) chain: ChainHandle,
    pub(crate) config: PropConfig,
    /// Global gossip dedup, keyed by hash-to-sign. A transaction is
    /// forwarded at most once per node, no matter how many peers echo it.
    pub(crate) txs_seen: Mutex<HashSet<String>>,
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
    incoming: Option<mpsc::UnboundedSender<TransactionSet>>,
    /// Peer addresses we dialed or learned from handshakes.
    known_addresses: Mutex<HashSet<String>>,
}

impl ServerInner {
    pub(crate) fn wants_txs(&self) -> bool {
        self.incoming.is_some()
    }

    pub(crate) fn register_connection(&self) -> (u64, mpsc::UnboundedReceiver<TransactionSet>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .insert(id, ConnectionEntry { gossip: tx });
        (id, rx)
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    /// Queue `txs` on every live connection except `exclude` (their
    /// originator). Each connection decides per its peer's subscription
    /// whether to actually send them.
    pub(crate) fn gossip(&self, exclude: Option<u64>, txs: &TransactionSet) {
        for (id, entry) in self.connections.lock().iter() {
            if Some(*id) != exclude {
                let _ = entry.gossip.send(txs.clone());
            }
        }
    }

    pub(crate) fn deliver_txs(&self, txs: &TransactionSet) {
        if let Some(incoming) = &self.incoming {
            let _ = incoming.send(txs.clone());
        }
    }

    pub(crate) fn learn_address(&self, address: String) {
        if self.known_addresses.lock().insert(address.clone()) {
            debug!(%address, "learned peer address");
        }
    }
}

/// Owns everything peer-facing for one node.
pub struct PropServer {
    inner: Arc<ServerInner>,
}

impl PropServer {
    /// `incoming` receives every transaction first heard from a peer;
    /// `None` means this node does not subscribe to transactions at all.
    pub fn new(
        chain: ChainHandle,
        config: PropConfig,
        incoming: Option<mpsc::UnboundedSender<TransactionSet>>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                chain,
                config,
                txs_seen: Mutex::new(HashSet::new()),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                incoming,
                known_addresses: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Bind the listener and start dialing `peers`. Returns the bound
    /// address (useful when listening on port 0).
    pub async fn start(
        &self,
        listen: SocketAddr,
        peers: &[String],
    ) -> Result<SocketAddr, WireError> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;
        info!(%local, "propagation listener up");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(run_inbound(Arc::clone(&inner), stream));
                    }
                    Err(e) => {
                        debug!(error = %e, "accept failed");
                    }
                }
            }
        });

        for peer in peers {
            self.connect(peer.clone());
        }
        Ok(local)
    }

    /// Dial an outbound peer. Dialing the same address twice is a no-op.
    pub fn connect(&self, address: String) {
        if !self.inner.known_addresses.lock().insert(address.clone()) {
            return;
        }
        tokio::spawn(run_outbound(Arc::clone(&self.inner), address));
    }

    /// Gossip locally originated transactions to all subscribed peers.
    /// Already-seen transactions are dropped here, not re-broadcast.
    pub fn send_txs(&self, txs: TransactionSet) {
        let mut fresh = TransactionSet::default();
        {
            let mut seen = self.inner.txs_seen.lock();
            macro_rules! keep_fresh {
                ($field:ident) => {
                    for tx in txs.$field {
                        if seen.insert(tx.hash_to_sign()) {
                            fresh.$field.push(tx);
                        }
                    }
                };
            }
            keep_fresh!(payments);
            keep_fresh!(sensor_registrations);
            keep_fresh!(broker_registrations);
            keep_fresh!(integrations);
            keep_fresh!(commits);
        }
        if !fresh.is_empty() {
            self.inner.gossip(None, &fresh);
        }
    }
}
