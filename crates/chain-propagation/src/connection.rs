//! One peer connection: the simplex session loop and outbound redialing.
//!
//! A session strictly alternates turns. The accepting side speaks first;
//! after sending, a side may not send again until it has received. While
//! we hold the turn (pacing before our send), an arriving message means
//! the peer is not following the protocol and the connection is torn
//! down. Outbound connections are redialed with exponential backoff;
//! inbound ones are simply dropped.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chain_store::service::{ChainError, ChainEvent};
use chain_types::transaction::Transaction;
use chain_types::{Block, TransactionSet};

use crate::message::{ChainSegment, PropMessage, Subscription, WireError};
use crate::server::ServerInner;

/// Tunables of the propagation protocol.
#[derive(Clone, Debug)]
pub struct PropConfig {
    /// Pause between receiving and replying, so bursts of local changes
    /// coalesce into one message. Zero sends immediately (tests).
    pub send_wait: Duration,
    /// Our own reachable address, announced to peers when set.
    pub advertised_address: Option<String>,
}

impl Default for PropConfig {
    fn default() -> Self {
        Self {
            send_wait: Duration::from_secs(1),
            advertised_address: None,
        }
    }
}

impl PropConfig {
    /// How long to wait for the peer's turn before declaring it stalled.
    pub fn recv_wait(&self) -> Duration {
        if self.send_wait.is_zero() {
            Duration::from_secs(10)
        } else {
            self.send_wait * 10
        }
    }
}

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(64);
const BACKOFF_JITTER_MS: u64 = 1000;

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

pub(crate) enum Role {
    Inbound,
    Outbound,
}

/// Keep redialing `addr` forever, running one session per successful
/// connect. Backoff doubles while dialing fails and resets after any
/// session that actually got established.
pub(crate) async fn run_outbound(inner: Arc<ServerInner>, addr: String) {
    let mut backoff = BACKOFF_START;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                backoff = BACKOFF_START;
                let (id, gossip) = inner.register_connection();
                info!(id, peer = %addr, "connected to peer");
                let result = run_session(&inner, id, stream, Role::Outbound, gossip).await;
                inner.remove_connection(id);
                if let Err(e) = result {
                    warn!(id, peer = %addr, error = %e, "peer session ended");
                }
            }
            Err(e) => {
                debug!(peer = %addr, error = %e, "dial failed");
            }
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS));
        tokio::time::sleep(backoff + jitter).await;
        backoff = next_backoff(backoff);
    }
}

/// Serve one accepted socket until it errors. No redial from this side.
pub(crate) async fn run_inbound(inner: Arc<ServerInner>, stream: TcpStream) {
    let (id, gossip) = inner.register_connection();
    let peer = stream.peer_addr().ok();
    info!(id, ?peer, "accepted peer");
    let result = run_session(&inner, id, stream, Role::Inbound, gossip).await;
    inner.remove_connection(id);
    if let Err(e) = result {
        warn!(id, ?peer, error = %e, "peer session ended");
    }
}

struct Session<'a> {
    inner: &'a Arc<ServerInner>,
    id: u64,
    /// Our estimate of the lowest index at which the peer's chain may
    /// diverge from ours. Every chain segment we send starts here.
    differing: usize,
    /// Head hash as of our last send; unchanged head means no chain
    /// segment is worth repeating.
    last_block_hash: String,
    /// Did the peer ask for transactions?
    peer_subscribed: bool,
    queue: PropMessage,
    queue_dirty: bool,
    events: broadcast::Receiver<ChainEvent>,
    gossip: mpsc::UnboundedReceiver<TransactionSet>,
}

async fn run_session(
    inner: &Arc<ServerInner>,
    id: u64,
    stream: TcpStream,
    role: Role,
    gossip: mpsc::UnboundedReceiver<TransactionSet>,
) -> Result<(), WireError> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Index 1 is the earliest possible divergence: every node shares the
    // fixed genesis block at index 0.
    let mut session = Session {
        inner,
        id,
        differing: 1,
        last_block_hash: String::new(),
        peer_subscribed: false,
        queue: PropMessage {
            sub: Some(Subscription {
                txs: inner.wants_txs(),
            }),
            address: inner.config.advertised_address.clone(),
            chain: None,
            txs: None,
        },
        queue_dirty: true,
        events: inner.chain.subscribe(),
        gossip,
    };

    if matches!(role, Role::Inbound) {
        session.send(&mut writer).await?;
    }
    loop {
        let line = session.wait_line(&mut lines).await?;
        session.handle_line(&line).await?;
        session.pace(&mut lines).await?;
        session.send(&mut writer).await?;
    }
}

impl Session<'_> {
    fn handle_event(&mut self, event: &ChainEvent) {
        if event.divergence < self.differing {
            self.differing = event.divergence;
        }
    }

    fn queue_gossip(&mut self, txs: TransactionSet) {
        if !self.peer_subscribed || txs.is_empty() {
            return;
        }
        self.queue
            .txs
            .get_or_insert_with(TransactionSet::default)
            .merge(txs);
        self.queue_dirty = true;
    }

    /// Our turn to listen: service chain events and gossip while waiting,
    /// fail if the peer stays silent past the receive window.
    async fn wait_line(
        &mut self,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
    ) -> Result<String, WireError> {
        let deadline = Instant::now() + self.inner.config.recv_wait();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    return line?.ok_or(WireError::PeerClosed);
                }
                event = self.events.recv() => {
                    if let Ok(event) = event {
                        self.handle_event(&event);
                    }
                }
                txs = self.gossip.recv() => {
                    match txs {
                        Some(txs) => self.queue_gossip(txs),
                        None => return Err(WireError::PeerClosed),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WireError::RecvTimeout);
                }
            }
        }
    }

    /// Our turn to speak, but paced: hold for `send_wait` so local bursts
    /// coalesce. The peer sending anything now is a protocol violation.
    async fn pace(
        &mut self,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
    ) -> Result<(), WireError> {
        let wait = self.inner.config.send_wait;
        if wait.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + wait;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    return match line? {
                        Some(_) => Err(WireError::Protocol("peer sent while we held the turn")),
                        None => Err(WireError::PeerClosed),
                    };
                }
                event = self.events.recv() => {
                    if let Ok(event) = event {
                        self.handle_event(&event);
                    }
                }
                txs = self.gossip.recv() => {
                    match txs {
                        Some(txs) => self.queue_gossip(txs),
                        None => return Err(WireError::PeerClosed),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(());
                }
            }
        }
    }

    async fn send(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), WireError> {
        let cached = self.inner.chain.cached_blocks().await?;
        let end = cached.start + cached.blocks.len();
        let head_hash = cached
            .blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| Block::genesis().hash);

        // Include our chain tail when the peer may be missing some of it
        // and our head actually moved, or when anything else queued up
        // makes this message non-trivial anyway.
        if (self.differing < end && self.last_block_hash != head_hash) || self.queue_dirty {
            let start = self.differing.max(cached.start);
            self.queue.chain = Some(ChainSegment {
                start,
                blocks: cached.blocks[start - cached.start..].to_vec(),
            });
            self.differing = end;
            self.last_block_hash = head_hash;
        }

        let msg = std::mem::take(&mut self.queue);
        self.queue_dirty = false;
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), WireError> {
        let msg: PropMessage = serde_json::from_str(line)?;
        if let Some(sub) = msg.sub {
            debug!(id = self.id, txs = sub.txs, "peer subscription");
            self.peer_subscribed = sub.txs;
        }
        if let Some(address) = msg.address {
            self.inner.learn_address(address);
        }
        if let Some(chain) = msg.chain {
            self.handle_chain(chain).await?;
        }
        if let Some(txs) = msg.txs {
            self.handle_txs(txs)?;
        }
        Ok(())
    }

    async fn handle_chain(&mut self, segment: ChainSegment) -> Result<(), WireError> {
        for block in &segment.blocks {
            block.verify()?;
        }
        let cached = self.inner.chain.cached_blocks().await?;
        if segment.start < cached.start {
            return Err(WireError::Protocol(
                "chain segment starts before our cached window",
            ));
        }
        if self.differing < segment.start {
            // Peer assumes we share more than we told it we do; nothing
            // here can attach to what we have.
            return Ok(());
        }
        if segment.start < self.differing {
            self.differing = segment.start;
        }

        let our_len = cached.start + cached.blocks.len();
        if segment.start + segment.blocks.len() <= our_len {
            // Not longer than us: just learn where we actually agree.
            for (i, block) in segment.blocks.iter().enumerate() {
                if cached.blocks[segment.start + i - cached.start].hash != block.hash {
                    self.differing = segment.start + i;
                    return Ok(());
                }
            }
            self.differing = segment.start + segment.blocks.len();
            return Ok(());
        }

        if !segment.blocks.is_empty() {
            match self
                .inner
                .chain
                .replace_chain(segment.start, segment.blocks)
                .await
            {
                Ok(()) => {
                    self.differing = self.inner.chain.length().await?;
                }
                // Raced against a concurrent local append; the next turn
                // sorts it out.
                Err(ChainError::NotStrictlyLonger { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Filter received transactions through the global seen-set, then
    /// hand the fresh ones to the local callback and to every other
    /// connection for re-broadcast.
    fn handle_txs(&mut self, txs: TransactionSet) -> Result<(), WireError> {
        txs.verify_all()?;

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
        if fresh.is_empty() {
            return Ok(());
        }
        debug!(id = self.id, count = fresh.len(), "new transactions from peer");
        self.inner.deliver_txs(&fresh);
        self.inner.gossip(Some(self.id), &fresh);
        Ok(())
    }
}
