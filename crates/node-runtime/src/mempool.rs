//! Pending transactions awaiting inclusion in a mined block.
//!
//! The pool deduplicates by hash-to-sign, prunes entries the chain has
//! overtaken after every head change, and assembles inclusion batches by
//! dry-running them against the current ledger so conflicting entries
//! (say, two payments reusing one counter) never end up in one block.

use std::collections::HashSet;

use tracing::debug;

use chain_store::service::{ChainError, ChainHandle};
use chain_store::state::IntegrationKey;
use chain_types::transaction::Transaction;
use chain_types::TransactionSet;

#[derive(Default)]
pub struct Mempool {
    pending: TransactionSet,
    hashes: HashSet<String>,
}

impl Mempool {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Add transactions, skipping any already pooled.
    pub fn add(&mut self, txs: TransactionSet) {
        macro_rules! pool {
            ($field:ident) => {
                for tx in txs.$field {
                    if self.hashes.insert(tx.hash_to_sign()) {
                        self.pending.$field.push(tx);
                    }
                }
            };
        }
        pool!(payments);
        pool!(sensor_registrations);
        pool!(broker_registrations);
        pool!(integrations);
        pool!(commits);
    }

    /// Drop entries the committed chain state has made unplayable:
    /// repeatable transactions whose counter no longer exceeds the
    /// signer's committed counter, and commits whose attestation already
    /// landed.
    pub async fn prune(&mut self, chain: &ChainHandle) -> Result<(), ChainError> {
        let before = self.len();

        macro_rules! prune_counted {
            ($field:ident) => {{
                let mut kept = Vec::with_capacity(self.pending.$field.len());
                for tx in self.pending.$field.drain(..) {
                    if tx.counter > chain.counter(&tx.input).await? {
                        kept.push(tx);
                    }
                }
                self.pending.$field = kept;
            }};
        }
        prune_counted!(payments);
        prune_counted!(sensor_registrations);
        prune_counted!(broker_registrations);
        prune_counted!(integrations);

        let mut kept = Vec::with_capacity(self.pending.commits.len());
        for tx in self.pending.commits.drain(..) {
            let key = IntegrationKey {
                input: tx.integration.input.clone(),
                counter: tx.integration.counter,
            };
            let attested = chain
                .integration(key)
                .await?
                .map(|ix| ix.witnesses.get(&tx.broker_name) == Some(&true))
                .unwrap_or(false);
            if !attested {
                kept.push(tx);
            }
        }
        self.pending.commits = kept;

        self.hashes = self.pending.hashes().into_iter().collect();
        if self.len() != before {
            debug!(before, after = self.len(), "mempool pruned");
        }
        Ok(())
    }

    /// Assemble the largest batch of pending transactions that is valid
    /// together as the next block's body, greedily and in pool order.
    pub async fn next_batch(
        &self,
        chain: &ChainHandle,
        reward: &str,
    ) -> Result<TransactionSet, ChainError> {
        let mut batch = TransactionSet::default();

        macro_rules! try_each {
            ($field:ident) => {
                for tx in &self.pending.$field {
                    let mut candidate = batch.clone();
                    candidate.$field.push(tx.clone());
                    if chain
                        .would_be_valid_block(reward.to_owned(), candidate.clone())
                        .await
                        .is_ok()
                    {
                        batch = candidate;
                    }
                }
            };
        }
        // Same order the updater applies them in.
        try_each!(payments);
        try_each!(integrations);
        try_each!(commits);
        try_each!(broker_registrations);
        try_each!(sensor_registrations);
        Ok(batch)
    }
}
