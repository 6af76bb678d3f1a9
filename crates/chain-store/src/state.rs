//! Ledger state and its undo log.
//!
//! Every mutation goes through the `set_*` methods, which record the prior
//! value in an [`UndoLog`] before writing. Undoing a log restores entries
//! in reverse order, so a state that applies a block and then undoes it is
//! identical to one that never saw the block. The updater relies on that
//! for atomic failure and the chain actor relies on it for reorganization.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use chain_types::transaction::{BrokerRegistration, Integration, SensorRegistration};
use chain_types::Block;

/// Balance and replay counter of one public key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub balance: u64,
    /// Highest committed transaction counter. New repeatable transactions
    /// must exceed it.
    pub counter: u64,
}

/// Integrations are keyed by the buyer and the buyer's counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IntegrationKey {
    pub input: String,
    pub counter: u64,
}

/// Broker and pricing pinned per integration output at application time.
///
/// Brokers and sensors can re-register later; the integration keeps
/// trading on the terms that were current when it was accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IntegrationOutputExtra {
    pub broker: String,
    pub cost_per_minute: u64,
    #[serde(rename = "costPerKB")]
    pub cost_per_kb: u64,
}

/// An accepted integration plus the lifecycle state accumulated on chain.
/// Lives only in ledger state; rebuilt by replay, never serialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrationExpanded {
    pub tx: Integration,
    /// Timestamp of the block that applied the integration.
    pub start_time: u64,
    /// Witness broker name to whether it has attested. BTreeMap so
    /// iteration order is deterministic across nodes.
    pub witnesses: BTreeMap<String, bool>,
    /// How many witnesses have attested so far.
    pub compensation_count: u64,
    /// One entry per output, same order as `tx.outputs`.
    pub outputs_extra: Vec<IntegrationOutputExtra>,
}

impl IntegrationExpanded {
    /// Attestations needed to release the escrow: a strict majority of
    /// witnesses, `ceil(witnessCount / 2)`.
    pub fn majority_threshold(&self) -> u64 {
        (self.tx.witness_count + 1) / 2
    }
}

/// The mutable keyed state the updater applies blocks against.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LedgerState {
    pub wallets: HashMap<String, Wallet>,
    pub sensors: HashMap<String, SensorRegistration>,
    pub brokers: HashMap<String, BrokerRegistration>,
    pub integrations: HashMap<IntegrationKey, IntegrationExpanded>,
}

impl LedgerState {
    /// Wallet for a key, zeroed if never seen.
    pub fn wallet(&self, key: &str) -> Wallet {
        self.wallets.get(key).copied().unwrap_or_default()
    }

    pub fn balance(&self, key: &str) -> u64 {
        self.wallet(key).balance
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.wallet(key).counter
    }

    pub fn set_wallet(&mut self, undo: &mut UndoLog, key: &str, value: Wallet) {
        let prior = self.wallets.insert(key.to_owned(), value);
        undo.entries.push(UndoEntry::Wallet {
            key: key.to_owned(),
            prior,
        });
    }

    pub fn set_sensor(&mut self, undo: &mut UndoLog, name: &str, value: SensorRegistration) {
        let prior = self.sensors.insert(name.to_owned(), value);
        undo.entries.push(UndoEntry::Sensor {
            key: name.to_owned(),
            prior,
        });
    }

    pub fn set_broker(&mut self, undo: &mut UndoLog, name: &str, value: BrokerRegistration) {
        let prior = self.brokers.insert(name.to_owned(), value);
        undo.entries.push(UndoEntry::Broker {
            key: name.to_owned(),
            prior,
        });
    }

    pub fn set_integration(
        &mut self,
        undo: &mut UndoLog,
        key: IntegrationKey,
        value: IntegrationExpanded,
    ) {
        let prior = self.integrations.insert(key.clone(), value);
        undo.entries.push(UndoEntry::Integration { key, prior });
    }
}

/// One recorded mutation: the key touched and the value it had before.
#[derive(Clone, Debug)]
enum UndoEntry {
    Wallet {
        key: String,
        prior: Option<Wallet>,
    },
    Sensor {
        key: String,
        prior: Option<SensorRegistration>,
    },
    Broker {
        key: String,
        prior: Option<BrokerRegistration>,
    },
    Integration {
        key: IntegrationKey,
        prior: Option<IntegrationExpanded>,
    },
}

/// The mutations one block application made, in order.
#[derive(Clone, Debug, Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restore every touched key to its prior value. Entries are replayed
    /// newest first, so a key mutated twice ends at its original value.
    pub fn undo(self, state: &mut LedgerState) {
        fn restore<K, V>(map: &mut HashMap<K, V>, key: K, prior: Option<V>)
        where
            K: std::hash::Hash + Eq,
        {
            match prior {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }

        for entry in self.entries.into_iter().rev() {
            match entry {
                UndoEntry::Wallet { key, prior } => restore(&mut state.wallets, key, prior),
                UndoEntry::Sensor { key, prior } => restore(&mut state.sensors, key, prior),
                UndoEntry::Broker { key, prior } => restore(&mut state.brokers, key, prior),
                UndoEntry::Integration { key, prior } => {
                    restore(&mut state.integrations, key, prior)
                }
            }
        }
    }
}

/// A block together with the undo log that reverts it. Owned by the chain
/// actor's in-memory window; blocks older than the window keep only their
/// persisted form and can no longer be undone.
#[derive(Clone, Debug)]
pub struct ChainLink {
    pub block: Block,
    pub undo: UndoLog,
}
