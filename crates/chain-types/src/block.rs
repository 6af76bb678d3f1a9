//! Proof-of-work sealed blocks.
//!
//! A block's hash covers its header fields plus, for each non-empty
//! transaction group in a fixed order, the group's name and its members'
//! signatures. Groups a block doesn't carry are omitted entirely, from the
//! serialized form and from the hash input alike, so blocks minted before
//! a transaction kind existed keep their original hashes.

use serde::{Deserialize, Serialize};

use crate::constants::{GENESIS_HASH, GENESIS_LAST_HASH, MINE_DIFFICULTY, MINE_RATE};
use crate::crypto;
use crate::error::VerifyError;
use crate::transaction::{
    BrokerRegistration, Commit, Integration, Payment, SensorRegistration, Transaction,
    TransactionSet,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Block {
    /// Milliseconds since the epoch, as claimed by the miner.
    pub timestamp: u64,
    pub last_hash: String,
    pub hash: String,
    /// The miner's public key; the subsidy and reward amounts go here.
    /// Empty only on the genesis block.
    pub reward: String,
    pub nonce: u64,
    pub difficulty: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments: Option<Vec<Payment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_registrations: Option<Vec<SensorRegistration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_registrations: Option<Vec<BrokerRegistration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrations: Option<Vec<Integration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commits: Option<Vec<Commit>>,
}

fn group<T>(txs: Vec<T>) -> Option<Vec<T>> {
    if txs.is_empty() {
        None
    } else {
        Some(txs)
    }
}

fn push_group<T: Transaction>(input: &mut String, name: &str, txs: &Option<Vec<T>>) {
    if let Some(txs) = txs {
        if !txs.is_empty() {
            input.push_str(name);
            for tx in txs {
                input.push_str(tx.signature());
            }
        }
    }
}

impl Block {
    /// Assemble and hash a block from already validated parts.
    pub fn new(
        timestamp: u64,
        last_hash: impl Into<String>,
        reward: impl Into<String>,
        nonce: u64,
        difficulty: u32,
        txs: TransactionSet,
    ) -> Self {
        let mut block = Self {
            timestamp,
            last_hash: last_hash.into(),
            hash: String::new(),
            reward: reward.into(),
            nonce,
            difficulty,
            payments: group(txs.payments),
            sensor_registrations: group(txs.sensor_registrations),
            broker_registrations: group(txs.broker_registrations),
            integrations: group(txs.integrations),
            commits: group(txs.commits),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The hardcoded first block every chain shares.
    pub fn genesis() -> Self {
        Self {
            timestamp: 0,
            last_hash: GENESIS_LAST_HASH.into(),
            hash: GENESIS_HASH.into(),
            reward: String::new(),
            nonce: 0,
            difficulty: MINE_DIFFICULTY,
            payments: None,
            sensor_registrations: None,
            broker_registrations: None,
            integrations: None,
            commits: None,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.hash == GENESIS_HASH && self.last_hash == GENESIS_LAST_HASH
    }

    /// The exact string the block hash is computed over.
    pub fn hash_input(&self) -> String {
        let mut input = format!(
            "{}{}{}{}{}",
            self.timestamp, self.last_hash, self.nonce, self.difficulty, self.reward
        );
        push_group(&mut input, "payments", &self.payments);
        push_group(
            &mut input,
            "sensorRegistrations",
            &self.sensor_registrations,
        );
        push_group(
            &mut input,
            "brokerRegistrations",
            &self.broker_registrations,
        );
        push_group(&mut input, "integrations", &self.integrations);
        push_group(&mut input, "commits", &self.commits);
        input
    }

    pub fn compute_hash(&self) -> String {
        crypto::hash_string(&self.hash_input())
    }

    /// Proof-of-work test: the hex hash must open with `difficulty` zero
    /// characters.
    pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
        hash.len() >= difficulty as usize
            && hash.bytes().take(difficulty as usize).all(|b| b == b'0')
    }

    /// Retarget for the block that will follow `last`: one step harder if
    /// `last` arrived ahead of the target interval, one step easier
    /// otherwise, never below zero.
    pub fn adjust_difficulty(last: &Block, current_time: u64) -> u32 {
        if last.timestamp + MINE_RATE > current_time {
            last.difficulty + 1
        } else {
            last.difficulty.saturating_sub(1)
        }
    }

    /// Structural verification of a single block in isolation: hash
    /// integrity, proof-of-work, group shape, and every member
    /// transaction's own verification. Linkage and economics are checked
    /// by the chain store.
    pub fn verify(&self) -> Result<(), VerifyError> {
        if self.is_genesis() {
            return Ok(());
        }
        if self.hash != self.compute_hash() {
            return Err(VerifyError::HashMismatch);
        }
        if !Self::meets_difficulty(&self.hash, self.difficulty) {
            return Err(VerifyError::DifficultyNotMet);
        }
        self.verify_groups()
    }

    fn verify_groups(&self) -> Result<(), VerifyError> {
        fn check<T: Transaction>(
            txs: &Option<Vec<T>>,
            name: &'static str,
        ) -> Result<(), VerifyError> {
            if let Some(txs) = txs {
                if txs.is_empty() {
                    return Err(VerifyError::EmptyTxArray(name));
                }
                for tx in txs {
                    tx.verify().map_err(|e| e.in_tx(name))?;
                }
            }
            Ok(())
        }
        check(&self.payments, "Payment")?;
        check(&self.sensor_registrations, "SensorRegistration")?;
        check(&self.broker_registrations, "BrokerRegistration")?;
        check(&self.integrations, "Integration")?;
        check(&self.commits, "Commit")
    }

    /// Clone the block's transactions into a [`TransactionSet`].
    pub fn transactions(&self) -> TransactionSet {
        TransactionSet {
            payments: self.payments.clone().unwrap_or_default(),
            sensor_registrations: self.sensor_registrations.clone().unwrap_or_default(),
            broker_registrations: self.broker_registrations.clone().unwrap_or_default(),
            integrations: self.integrations.clone().unwrap_or_default(),
            commits: self.commits.clone().unwrap_or_default(),
        }
    }

    /// Mine a valid successor synchronously. Test helper; the node's real
    /// miner is cooperative and lives in the chain store crate.
    pub fn debug_mine(last: &Block, reward: impl Into<String>, txs: TransactionSet) -> Self {
        let timestamp = last.timestamp + MINE_RATE;
        let difficulty = Self::adjust_difficulty(last, timestamp);
        let reward = reward.into();
        let mut nonce = 0u64;
        loop {
            let block = Self::new(
                timestamp,
                last.hash.clone(),
                reward.clone(),
                nonce,
                difficulty,
                txs.clone(),
            );
            if Self::meets_difficulty(&block.hash, difficulty) {
                return block;
            }
            nonce += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::transaction::PaymentOutput;

    fn payment(keypair: &Keypair, counter: u64) -> Payment {
        Payment::new(
            keypair,
            counter,
            vec![PaymentOutput {
                public_key: Keypair::generate().public_key(),
                amount: 5,
            }],
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_genesis_verifies() {
        assert!(Block::genesis().verify().is_ok());
        assert!(Block::genesis().is_genesis());
    }

    #[test]
    fn test_mined_block_verifies() {
        let miner = Keypair::generate();
        let block = Block::debug_mine(
            &Block::genesis(),
            miner.public_key(),
            TransactionSet::default(),
        );
        assert!(block.verify().is_ok());
        assert_eq!(block.last_hash, GENESIS_HASH);
    }

    #[test]
    fn test_tampered_nonce_detected() {
        let miner = Keypair::generate();
        let mut block = Block::debug_mine(
            &Block::genesis(),
            miner.public_key(),
            TransactionSet::default(),
        );
        block.nonce += 1;
        assert_eq!(block.verify(), Err(VerifyError::HashMismatch));
    }

    #[test]
    fn test_hash_covers_transaction_signatures() {
        let miner = Keypair::generate();
        let sender = Keypair::generate();
        let mut txs = TransactionSet::default();
        txs.payments.push(payment(&sender, 1));
        let block = Block::debug_mine(&Block::genesis(), miner.public_key(), txs);
        assert!(block.verify().is_ok());

        let mut tampered = block.clone();
        tampered.payments = Some(vec![payment(&sender, 2)]);
        assert_eq!(tampered.verify(), Err(VerifyError::HashMismatch));
    }

    #[test]
    fn test_empty_group_rejected() {
        let miner = Keypair::generate();
        let mut block = Block::debug_mine(
            &Block::genesis(),
            miner.public_key(),
            TransactionSet::default(),
        );
        block.payments = Some(vec![]);
        block.hash = block.compute_hash();
        assert_eq!(block.verify(), Err(VerifyError::EmptyTxArray("Payment")));
    }

    #[test]
    fn test_difficulty_retarget() {
        let genesis = Block::genesis();
        // Arrived faster than the target interval: harder.
        assert_eq!(
            Block::adjust_difficulty(&genesis, genesis.timestamp + MINE_RATE - 1),
            genesis.difficulty + 1
        );
        // Arrived at or beyond the interval: easier.
        assert_eq!(
            Block::adjust_difficulty(&genesis, genesis.timestamp + MINE_RATE),
            genesis.difficulty - 1
        );
    }

    #[test]
    fn test_difficulty_floor() {
        let mut block = Block::genesis();
        block.difficulty = 0;
        assert_eq!(Block::adjust_difficulty(&block, u64::MAX), 0);
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(Block::meets_difficulty("000abc", 3));
        assert!(!Block::meets_difficulty("00abc", 3));
        assert!(Block::meets_difficulty("anything", 0));
    }

    #[test]
    fn test_empty_groups_omitted_from_wire() {
        let value = serde_json::to_value(Block::genesis()).unwrap();
        assert!(value.get("payments").is_none());
        assert!(value.get("lastHash").is_some());
        let back: Block = serde_json::from_value(value).unwrap();
        assert_eq!(back, Block::genesis());
    }
}
