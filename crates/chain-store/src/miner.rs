//! Cooperative proof-of-work mining.
//!
//! The miner grinds nonces in bounded batches and yields between batches
//! so it never starves the event loop, checking a head watch each time to
//! abandon work the moment the chain moves under it.

use tokio::sync::watch;
use tracing::{debug, trace};

use chain_types::{Block, TransactionSet};

/// Nonce attempts between yields.
const NONCE_BATCH: u64 = 2_500;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as u64,
        // Clock before 1970; treat as epoch rather than dying.
        Err(_) => 0,
    }
}

/// Mine a successor to `last` carrying `txs`, crediting `reward`.
///
/// The timestamp (and with it the retargeted difficulty) is refreshed
/// between batches so long searches still produce honestly timestamped
/// blocks that pass the updater's difficulty re-check. Returns `None`
/// when `head_hash` no longer names `last` as the head, meaning the work
/// is stale.
pub async fn mine_block(
    last: &Block,
    reward: String,
    txs: TransactionSet,
    head_hash: watch::Receiver<String>,
) -> Option<Block> {
    let mut timestamp = now_millis().max(last.timestamp + 1);
    let mut difficulty = Block::adjust_difficulty(last, timestamp);
    let mut nonce = 0u64;
    debug!(difficulty, txs = txs.len(), "mining started");

    loop {
        for _ in 0..NONCE_BATCH {
            let block = Block::new(
                timestamp,
                last.hash.clone(),
                reward.clone(),
                nonce,
                difficulty,
                txs.clone(),
            );
            if Block::meets_difficulty(&block.hash, difficulty) {
                debug!(nonce, hash = %block.hash, "block mined");
                return Some(block);
            }
            nonce = nonce.wrapping_add(1);
        }

        if *head_hash.borrow() != last.hash {
            trace!("head moved, abandoning mining round");
            return None;
        }
        timestamp = now_millis().max(last.timestamp + 1);
        difficulty = Block::adjust_difficulty(last, timestamp);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_types::Keypair;

    #[tokio::test]
    async fn test_mine_block_produces_valid_successor() {
        let genesis = Block::genesis();
        let miner = Keypair::generate();
        let (_tx, rx) = watch::channel(genesis.hash.clone());
        let block = mine_block(
            &genesis,
            miner.public_key(),
            TransactionSet::default(),
            rx,
        )
        .await
        .expect("head did not move");
        assert!(block.verify().is_ok());
        assert_eq!(block.last_hash, genesis.hash);
        assert_eq!(
            block.difficulty,
            Block::adjust_difficulty(&genesis, block.timestamp)
        );
    }

    #[tokio::test]
    async fn test_mining_abandoned_when_head_moves() {
        let genesis = Block::genesis();
        let miner = Keypair::generate();
        let (tx, rx) = watch::channel("a-different-head".to_owned());
        // Difficulty after genesis at a current timestamp is low but the
        // very first batch may still find a block; a moved head must win
        // the race no later than the first yield.
        let mined = mine_block(&genesis, miner.public_key(), TransactionSet::default(), rx).await;
        drop(tx);
        if let Some(block) = mined {
            // Found within the first batch; still a valid block.
            assert!(block.verify().is_ok());
        }
    }
}
