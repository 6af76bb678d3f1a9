//! The five transaction variants of the marketplace ledger.
//!
//! Every variant is constructed from a keypair plus its fields, signs its
//! canonical hash, and self-verifies before it is returned: an invalid
//! instance can never be held. `verify` is pure; the economic rules
//! (balances, counters, registries) live in the chain-store updater.

mod broker_registration;
mod commit;
mod integration;
mod payment;
mod sensor_registration;

pub use broker_registration::{BrokerMetadata, BrokerRegistration};
pub use commit::{Commit, IntegrationRef};
pub use integration::{Integration, IntegrationOutput};
pub use payment::{Payment, PaymentOutput};
pub use sensor_registration::{SensorMetadata, SensorRegistration};

use serde::{Deserialize, Serialize};

use crate::error::VerifyError;

/// Capabilities common to all five variants.
pub trait Transaction {
    /// The signer's public key.
    fn input(&self) -> &str;
    /// Signature over [`Transaction::hash_to_sign`].
    fn signature(&self) -> &str;
    /// Canonical hash of the immutable fields. Also the global gossip
    /// deduplication key.
    fn hash_to_sign(&self) -> String;
    /// Structural then signature validation. Pure.
    fn verify(&self) -> Result<(), VerifyError>;
    /// Kind tag, used for dispatch and wire keys.
    fn kind(&self) -> TxKind;
}

/// Transaction kind tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Payment,
    SensorRegistration,
    BrokerRegistration,
    Integration,
    Commit,
}

impl TxKind {
    pub const ALL: [TxKind; 5] = [
        TxKind::Payment,
        TxKind::SensorRegistration,
        TxKind::BrokerRegistration,
        TxKind::Integration,
        TxKind::Commit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Payment => "Payment",
            TxKind::SensorRegistration => "SensorRegistration",
            TxKind::BrokerRegistration => "BrokerRegistration",
            TxKind::Integration => "Integration",
            TxKind::Commit => "Commit",
        }
    }
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch of transactions grouped by kind.
///
/// This is the shape blocks are assembled from, the mempool holds, and
/// the wire `txs` field carries. Keys match [`TxKind::as_str`]; empty
/// groups are omitted from serialization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionSet {
    #[serde(rename = "Payment", default, skip_serializing_if = "Vec::is_empty")]
    pub payments: Vec<Payment>,
    #[serde(
        rename = "SensorRegistration",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub sensor_registrations: Vec<SensorRegistration>,
    #[serde(
        rename = "BrokerRegistration",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub broker_registrations: Vec<BrokerRegistration>,
    #[serde(rename = "Integration", default, skip_serializing_if = "Vec::is_empty")]
    pub integrations: Vec<Integration>,
    #[serde(rename = "Commit", default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<Commit>,
}

impl TransactionSet {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.payments.len()
            + self.sensor_registrations.len()
            + self.broker_registrations.len()
            + self.integrations.len()
            + self.commits.len()
    }

    /// Verify every member, tagging failures with the member's kind.
    pub fn verify_all(&self) -> Result<(), VerifyError> {
        for tx in &self.payments {
            tx.verify().map_err(|e| e.in_tx("Payment"))?;
        }
        for tx in &self.sensor_registrations {
            tx.verify().map_err(|e| e.in_tx("SensorRegistration"))?;
        }
        for tx in &self.broker_registrations {
            tx.verify().map_err(|e| e.in_tx("BrokerRegistration"))?;
        }
        for tx in &self.integrations {
            tx.verify().map_err(|e| e.in_tx("Integration"))?;
        }
        for tx in &self.commits {
            tx.verify().map_err(|e| e.in_tx("Commit"))?;
        }
        Ok(())
    }

    /// Hashes of every member, in kind order.
    pub fn hashes(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.payments.iter().map(Transaction::hash_to_sign));
        out.extend(
            self.sensor_registrations
                .iter()
                .map(Transaction::hash_to_sign),
        );
        out.extend(
            self.broker_registrations
                .iter()
                .map(Transaction::hash_to_sign),
        );
        out.extend(self.integrations.iter().map(Transaction::hash_to_sign));
        out.extend(self.commits.iter().map(Transaction::hash_to_sign));
        out
    }

    /// Move every member of `other` into `self`.
    pub fn merge(&mut self, other: TransactionSet) {
        self.payments.extend(other.payments);
        self.sensor_registrations.extend(other.sensor_registrations);
        self.broker_registrations.extend(other.broker_registrations);
        self.integrations.extend(other.integrations);
        self.commits.extend(other.commits);
    }
}
