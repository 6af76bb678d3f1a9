//! The chain actor.
//!
//! All chain mutation runs inside one task that consumes commands from an
//! mpsc channel. That single consumer is the single-flight queue the
//! protocol requires: at most one add or replace operation is in flight
//! at a time, including its persistence await points, so the multi-step
//! reorganization can never observe concurrent mutation. Listeners get
//! [`ChainEvent`]s on a broadcast channel, always after full commit.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chain_types::transaction::{BrokerRegistration, SensorRegistration, TransactionSet};
use chain_types::{Block, MAX_BLOCKS_IN_MEMORY};

use crate::miner::now_millis;
use crate::persistence::{BlockStore, StoreError};
use crate::state::{ChainLink, IntegrationExpanded, IntegrationKey, LedgerState};
use crate::updater::{apply_block, would_be_valid, UpdateError};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("candidate of length {candidate} does not exceed current length {current}")]
    NotStrictlyLonger { current: usize, candidate: usize },

    #[error("candidate diverges at {start} but the in-memory window begins at {oldest}")]
    DivergenceTooOld { start: usize, oldest: usize },

    #[error("no block at index {0}")]
    UnknownBlock(usize),

    #[error("persisted chain does not start at the genesis block")]
    BadGenesis,

    #[error("chain actor has shut down")]
    Closed,
}

/// Emitted after every committed head change. `divergence` is the chain
/// index of the first block in `blocks`; a plain append has
/// `divergence == old length`, a reorganization points further back.
#[derive(Clone, Debug)]
pub struct ChainEvent {
    pub divergence: usize,
    pub blocks: Vec<Block>,
}

/// The in-memory window: `start` is the chain index of `blocks[0]`.
#[derive(Clone, Debug)]
pub struct CachedBlocks {
    pub start: usize,
    pub blocks: Vec<Block>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    AddBlock {
        block: Block,
        reply: Reply<Result<(), ChainError>>,
    },
    ReplaceChain {
        start: usize,
        blocks: Vec<Block>,
        reply: Reply<Result<(), ChainError>>,
    },
    GetBlock {
        index: usize,
        reply: Reply<Result<Block, ChainError>>,
    },
    BlocksFrom {
        from: usize,
        reply: Reply<Result<Vec<Block>, ChainError>>,
    },
    CachedBlocks {
        reply: Reply<CachedBlocks>,
    },
    Length {
        reply: Reply<usize>,
    },
    WouldBeValidBlock {
        reward: String,
        txs: TransactionSet,
        reply: Reply<Result<(), ChainError>>,
    },
    Balance {
        key: String,
        reply: Reply<u64>,
    },
    Counter {
        key: String,
        reply: Reply<u64>,
    },
    GetSensor {
        name: String,
        reply: Reply<Option<SensorRegistration>>,
    },
    GetBroker {
        name: String,
        reply: Reply<Option<BrokerRegistration>>,
    },
    GetIntegration {
        key: IntegrationKey,
        reply: Reply<Option<IntegrationExpanded>>,
    },
    Sensors {
        reply: Reply<HashMap<String, SensorRegistration>>,
    },
    Brokers {
        reply: Reply<HashMap<String, BrokerRegistration>>,
    },
}

/// Cloneable client of the chain actor.
#[derive(Clone)]
pub struct ChainHandle {
    cmd: mpsc::Sender<Command>,
    events: broadcast::Sender<ChainEvent>,
}

impl ChainHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ChainError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(make(tx))
            .await
            .map_err(|_| ChainError::Closed)?;
        rx.await.map_err(|_| ChainError::Closed)
    }

    pub async fn add_block(&self, block: Block) -> Result<(), ChainError> {
        self.request(|reply| Command::AddBlock { block, reply })
            .await?
    }

    pub async fn replace_chain(&self, start: usize, blocks: Vec<Block>) -> Result<(), ChainError> {
        self.request(|reply| Command::ReplaceChain {
            start,
            blocks,
            reply,
        })
        .await?
    }

    pub async fn block(&self, index: usize) -> Result<Block, ChainError> {
        self.request(|reply| Command::GetBlock { index, reply })
            .await?
    }

    /// Every block from `from` (inclusive) to the head.
    pub async fn blocks_from(&self, from: usize) -> Result<Vec<Block>, ChainError> {
        self.request(|reply| Command::BlocksFrom { from, reply })
            .await?
    }

    pub async fn cached_blocks(&self) -> Result<CachedBlocks, ChainError> {
        self.request(|reply| Command::CachedBlocks { reply }).await
    }

    pub async fn length(&self) -> Result<usize, ChainError> {
        self.request(|reply| Command::Length { reply }).await
    }

    /// Miner's dry run: could these transactions form the next block?
    pub async fn would_be_valid_block(
        &self,
        reward: String,
        txs: TransactionSet,
    ) -> Result<(), ChainError> {
        self.request(|reply| Command::WouldBeValidBlock { reward, txs, reply })
            .await?
    }

    pub async fn balance(&self, key: &str) -> Result<u64, ChainError> {
        let key = key.to_owned();
        self.request(|reply| Command::Balance { key, reply }).await
    }

    pub async fn counter(&self, key: &str) -> Result<u64, ChainError> {
        let key = key.to_owned();
        self.request(|reply| Command::Counter { key, reply }).await
    }

    pub async fn sensor(&self, name: &str) -> Result<Option<SensorRegistration>, ChainError> {
        let name = name.to_owned();
        self.request(|reply| Command::GetSensor { name, reply })
            .await
    }

    pub async fn broker(&self, name: &str) -> Result<Option<BrokerRegistration>, ChainError> {
        let name = name.to_owned();
        self.request(|reply| Command::GetBroker { name, reply })
            .await
    }

    pub async fn integration(
        &self,
        key: IntegrationKey,
    ) -> Result<Option<IntegrationExpanded>, ChainError> {
        self.request(|reply| Command::GetIntegration { key, reply })
            .await
    }

    pub async fn sensors(&self) -> Result<HashMap<String, SensorRegistration>, ChainError> {
        self.request(|reply| Command::Sensors { reply }).await
    }

    pub async fn brokers(&self) -> Result<HashMap<String, BrokerRegistration>, ChainError> {
        self.request(|reply| Command::Brokers { reply }).await
    }

    /// Subscribe to committed head changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }
}

/// The actor state. Constructed by [`Blockchain::open`], then owned by the
/// consumer task.
pub struct Blockchain {
    store: BlockStore,
    state: LedgerState,
    /// Links for chain indices `offset..offset + links.len()`.
    links: VecDeque<ChainLink>,
    /// Block at `offset - 1`, kept for linkage checks once the window no
    /// longer reaches back to genesis.
    anchor: Block,
    offset: usize,
    events: broadcast::Sender<ChainEvent>,
}

impl Blockchain {
    /// Open the store at `dir`, replay every persisted block to rebuild
    /// ledger state, and spawn the actor task.
    pub async fn open(
        dir: impl Into<std::path::PathBuf>,
    ) -> Result<(ChainHandle, JoinHandle<()>), ChainError> {
        let mut store = BlockStore::open(dir).await?;
        if store.block_count() == 0 {
            store.write_blocks(0, &[Block::genesis()]).await?;
        } else if !store.read_block(0).await?.is_genesis() {
            return Err(ChainError::BadGenesis);
        }

        let (events, _) = broadcast::channel(64);
        let mut chain = Self {
            store,
            state: LedgerState::default(),
            links: VecDeque::new(),
            anchor: Block::genesis(),
            offset: 1,
            events,
        };

        let count = chain.store.block_count();
        let mut prev = Block::genesis();
        for i in 1..count {
            let block = chain.store.read_block(i).await?;
            let undo = apply_block(&mut chain.state, &prev, &block)?;
            prev = block.clone();
            chain.links.push_back(ChainLink { block, undo });
            chain.trim();
        }
        info!(blocks = count, "chain replayed from disk");

        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        let handle = ChainHandle {
            cmd: cmd_tx,
            events: chain.events.clone(),
        };
        let join = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                chain.handle(cmd).await;
            }
            debug!("chain actor stopping");
        });
        Ok((handle, join))
    }

    fn len(&self) -> usize {
        self.offset + self.links.len()
    }

    fn head(&self) -> &Block {
        self.links.back().map(|l| &l.block).unwrap_or(&self.anchor)
    }

    fn trim(&mut self) {
        while self.links.len() > MAX_BLOCKS_IN_MEMORY {
            if let Some(link) = self.links.pop_front() {
                self.anchor = link.block;
                self.offset += 1;
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AddBlock { block, reply } => {
                let _ = reply.send(self.add_block(block).await);
            }
            Command::ReplaceChain {
                start,
                blocks,
                reply,
            } => {
                let _ = reply.send(self.replace_chain(start, blocks).await);
            }
            Command::GetBlock { index, reply } => {
                let _ = reply.send(self.block(index).await);
            }
            Command::BlocksFrom { from, reply } => {
                let _ = reply.send(self.blocks_from(from).await);
            }
            Command::CachedBlocks { reply } => {
                let _ = reply.send(CachedBlocks {
                    start: self.offset,
                    blocks: self.links.iter().map(|l| l.block.clone()).collect(),
                });
            }
            Command::Length { reply } => {
                let _ = reply.send(self.len());
            }
            Command::WouldBeValidBlock { reward, txs, reply } => {
                let result = would_be_valid(&mut self.state, &reward, now_millis(), &txs)
                    .map_err(ChainError::from);
                let _ = reply.send(result);
            }
            Command::Balance { key, reply } => {
                let _ = reply.send(self.state.balance(&key));
            }
            Command::Counter { key, reply } => {
                let _ = reply.send(self.state.counter(&key));
            }
            Command::GetSensor { name, reply } => {
                let _ = reply.send(self.state.sensors.get(&name).cloned());
            }
            Command::GetBroker { name, reply } => {
                let _ = reply.send(self.state.brokers.get(&name).cloned());
            }
            Command::GetIntegration { key, reply } => {
                let _ = reply.send(self.state.integrations.get(&key).cloned());
            }
            Command::Sensors { reply } => {
                let _ = reply.send(self.state.sensors.clone());
            }
            Command::Brokers { reply } => {
                let _ = reply.send(self.state.brokers.clone());
            }
        }
    }

    async fn add_block(&mut self, block: Block) -> Result<(), ChainError> {
        let prev = self.head().clone();
        let undo = apply_block(&mut self.state, &prev, &block)?;
        let index = self.len();
        if let Err(e) = self
            .store
            .write_blocks(index, std::slice::from_ref(&block))
            .await
        {
            undo.undo(&mut self.state);
            return Err(e.into());
        }
        self.links.push_back(ChainLink {
            block: block.clone(),
            undo,
        });
        self.trim();
        debug!(index, hash = %block.hash, "block appended");
        let _ = self.events.send(ChainEvent {
            divergence: index,
            blocks: vec![block],
        });
        Ok(())
    }

    async fn replace_chain(
        &mut self,
        start: usize,
        blocks: Vec<Block>,
    ) -> Result<(), ChainError> {
        let current = self.len();
        let candidate = start + blocks.len();
        if candidate <= current {
            return Err(ChainError::NotStrictlyLonger { current, candidate });
        }
        if start < self.offset {
            // Reorganizing past the retained window would need undo data
            // we no longer hold. Documented operational limit.
            return Err(ChainError::DivergenceTooOld {
                start,
                oldest: self.offset,
            });
        }

        // First index where the candidate actually differs from us.
        let mut divergence = start;
        while divergence < current {
            let ours = &self.links[divergence - self.offset].block;
            if ours.hash != blocks[divergence - start].hash {
                break;
            }
            divergence += 1;
        }

        // Undo our blocks back to the divergence point, keeping them for
        // the abort path.
        let mut undone: Vec<Block> = Vec::with_capacity(current - divergence);
        while self.len() > divergence {
            if let Some(link) = self.links.pop_back() {
                link.undo.undo(&mut self.state);
                undone.push(link.block);
            }
        }

        // Apply the candidate suffix.
        let suffix = &blocks[divergence - start..];
        let mut new_links: Vec<ChainLink> = Vec::with_capacity(suffix.len());
        let mut prev = self.head().clone();
        let mut failure: Option<ChainError> = None;
        for block in suffix {
            match apply_block(&mut self.state, &prev, block) {
                Ok(undo) => {
                    prev = block.clone();
                    new_links.push(ChainLink {
                        block: block.clone(),
                        undo,
                    });
                }
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            }
        }

        if failure.is_none() {
            if let Err(e) = self.store.write_blocks(divergence, suffix).await {
                failure = Some(e.into());
            }
        }

        if let Some(e) = failure {
            warn!(start, divergence, error = %e, "reorganization aborted");
            self.rollback_reorg(new_links, undone);
            return Err(e);
        }

        self.links.extend(new_links);
        self.trim();
        info!(
            divergence,
            length = self.len(),
            "reorganized to longer chain"
        );
        let _ = self.events.send(ChainEvent {
            divergence,
            blocks: suffix.to_vec(),
        });
        Ok(())
    }

    /// Abort path of `replace_chain`: drop whatever candidate prefix was
    /// applied and re-apply the undone original blocks. The original
    /// blocks were valid moments ago against this exact state, so failure
    /// here means the undo machinery broke an invariant.
    fn rollback_reorg(&mut self, mut new_links: Vec<ChainLink>, undone: Vec<Block>) {
        while let Some(link) = new_links.pop() {
            link.undo.undo(&mut self.state);
        }
        let mut prev = self.head().clone();
        for block in undone.into_iter().rev() {
            match apply_block(&mut self.state, &prev, &block) {
                Ok(undo) => {
                    prev = block.clone();
                    self.links.push_back(ChainLink { block, undo });
                }
                Err(e) => panic!("state corrupt: undone block no longer re-applies: {e}"),
            }
        }
    }

    async fn block(&self, index: usize) -> Result<Block, ChainError> {
        if index >= self.len() {
            return Err(ChainError::UnknownBlock(index));
        }
        if index >= self.offset {
            return Ok(self.links[index - self.offset].block.clone());
        }
        if index + 1 == self.offset {
            return Ok(self.anchor.clone());
        }
        Ok(self.store.read_block(index).await?)
    }

    async fn blocks_from(&self, from: usize) -> Result<Vec<Block>, ChainError> {
        let mut out = Vec::with_capacity(self.len().saturating_sub(from));
        for i in from..self.len() {
            out.push(self.block(i).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_types::transaction::{Payment, PaymentOutput};
    use chain_types::{Keypair, MINING_REWARD};

    fn mine_chain(miner: &Keypair, len: usize) -> Vec<Block> {
        let mut blocks = vec![Block::genesis()];
        for _ in 0..len {
            blocks.push(Block::debug_mine(
                blocks.last().unwrap(),
                miner.public_key(),
                TransactionSet::default(),
            ));
        }
        blocks
    }

    #[tokio::test]
    async fn test_add_block_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Keypair::generate();
        let blocks = mine_chain(&miner, 2);
        {
            let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
            chain.add_block(blocks[1].clone()).await.unwrap();
            chain.add_block(blocks[2].clone()).await.unwrap();
            assert_eq!(chain.length().await.unwrap(), 3);
            assert_eq!(
                chain.balance(&miner.public_key()).await.unwrap(),
                2 * MINING_REWARD
            );
        }
        // State is not persisted; it must rebuild identically by replay.
        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        assert_eq!(chain.length().await.unwrap(), 3);
        assert_eq!(
            chain.balance(&miner.public_key()).await.unwrap(),
            2 * MINING_REWARD
        );
        assert_eq!(chain.block(2).await.unwrap(), blocks[2]);
    }

    #[tokio::test]
    async fn test_events_reflect_committed_appends() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Keypair::generate();
        let blocks = mine_chain(&miner, 1);
        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        let mut events = chain.subscribe();
        chain.add_block(blocks[1].clone()).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.divergence, 1);
        assert_eq!(event.blocks, vec![blocks[1].clone()]);
    }

    #[tokio::test]
    async fn test_longer_branch_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let miner_a = Keypair::generate();
        let miner_b = Keypair::generate();
        let ours = mine_chain(&miner_a, 1);
        let theirs = mine_chain(&miner_b, 2);

        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        chain.add_block(ours[1].clone()).await.unwrap();
        let mut events = chain.subscribe();

        chain
            .replace_chain(1, theirs[1..].to_vec())
            .await
            .unwrap();
        assert_eq!(chain.length().await.unwrap(), 3);
        assert_eq!(chain.balance(&miner_a.public_key()).await.unwrap(), 0);
        assert_eq!(
            chain.balance(&miner_b.public_key()).await.unwrap(),
            2 * MINING_REWARD
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.divergence, 1);
        assert_eq!(event.blocks.len(), 2);
    }

    #[tokio::test]
    async fn test_equal_length_does_not_replace() {
        let dir = tempfile::tempdir().unwrap();
        let miner_a = Keypair::generate();
        let miner_b = Keypair::generate();
        let ours = mine_chain(&miner_a, 2);
        let theirs = mine_chain(&miner_b, 2);

        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        chain.add_block(ours[1].clone()).await.unwrap();
        chain.add_block(ours[2].clone()).await.unwrap();

        let err = chain
            .replace_chain(1, theirs[1..].to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::NotStrictlyLonger {
                current: 3,
                candidate: 3
            }
        ));
        assert_eq!(chain.block(2).await.unwrap(), ours[2]);
    }

    #[tokio::test]
    async fn test_invalid_candidate_leaves_chain_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Keypair::generate();
        let sender = Keypair::generate();
        let ours = mine_chain(&miner, 2);

        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        chain.add_block(ours[1].clone()).await.unwrap();
        chain.add_block(ours[2].clone()).await.unwrap();

        // A longer branch whose last block overspends.
        let mut branch = mine_chain(&miner, 1);
        let doomed = Payment::new(
            &sender,
            1,
            vec![PaymentOutput {
                public_key: miner.public_key(),
                amount: 999,
            }],
            0,
        )
        .unwrap();
        let mut txs = TransactionSet::default();
        txs.payments.push(doomed);
        branch.push(Block::debug_mine(&branch[1], miner.public_key(), txs.clone()));
        branch.push(Block::debug_mine(&branch[2], miner.public_key(), txs));

        let err = chain
            .replace_chain(1, branch[1..].to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Update(_)));

        // Untouched: same head, same balances, same persisted blocks.
        assert_eq!(chain.length().await.unwrap(), 3);
        assert_eq!(chain.block(2).await.unwrap(), ours[2]);
        assert_eq!(
            chain.balance(&miner.public_key()).await.unwrap(),
            2 * MINING_REWARD
        );
    }

    #[tokio::test]
    async fn test_divergence_before_window_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Keypair::generate();
        let blocks = mine_chain(&miner, 1);
        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        chain.add_block(blocks[1].clone()).await.unwrap();

        let err = chain.replace_chain(0, blocks.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            ChainError::DivergenceTooOld { start: 0, oldest: 1 }
        ));
    }

    #[tokio::test]
    async fn test_dry_run_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Keypair::generate();
        let blocks = mine_chain(&miner, 1);
        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        chain.add_block(blocks[1].clone()).await.unwrap();

        let pay = Payment::new(
            &miner,
            1,
            vec![PaymentOutput {
                public_key: Keypair::generate().public_key(),
                amount: 10,
            }],
            0,
        )
        .unwrap();
        let mut txs = TransactionSet::default();
        txs.payments.push(pay);
        chain
            .would_be_valid_block(miner.public_key(), txs.clone())
            .await
            .unwrap();
        // Dry run must not commit the counter.
        chain
            .would_be_valid_block(miner.public_key(), txs)
            .await
            .unwrap();
    }
}
