use serde::{Deserialize, Serialize};

use crate::crypto::{self, Keypair};
use crate::error::VerifyError;
use crate::rdf::{LiteralTriple, NodeTriple};
use crate::transaction::{Transaction, TxKind};

/// Registers (or, for the same owner, updates) a named sensor and its
/// pricing, and pins it to an already registered broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorRegistration {
    /// Signer's public key; the sensor's owner.
    pub input: String,
    pub counter: u64,
    pub reward_amount: u64,
    pub metadata: SensorMetadata,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorMetadata {
    /// Marketplace name of the sensor, unique per the squatting rule.
    pub name: String,
    pub cost_per_minute: u64,
    #[serde(rename = "costPerKB")]
    pub cost_per_kb: u64,
    /// Name of the broker that serves this sensor's data. Must already be
    /// registered when the transaction is applied.
    pub integration_broker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_nodes: Option<Vec<NodeTriple>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_literals: Option<Vec<LiteralTriple>>,
}

impl SensorRegistration {
    pub fn new(
        keypair: &Keypair,
        counter: u64,
        metadata: SensorMetadata,
        reward_amount: u64,
    ) -> Result<Self, VerifyError> {
        let mut tx = Self {
            input: keypair.public_key(),
            counter,
            reward_amount,
            metadata,
            signature: String::new(),
        };
        tx.signature = keypair.sign(&tx.hash_to_sign());
        tx.verify()?;
        Ok(tx)
    }
}

impl Transaction for SensorRegistration {
    fn input(&self) -> &str {
        &self.input
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn hash_to_sign(&self) -> String {
        crypto::hash_data(&(self.counter, self.reward_amount, &self.metadata))
    }

    fn verify(&self) -> Result<(), VerifyError> {
        if self.counter == 0 {
            return Err(VerifyError::ZeroCounter);
        }
        let meta = &self.metadata;
        if meta.name.is_empty() {
            return Err(VerifyError::EmptyName("sensor name"));
        }
        if meta.integration_broker.is_empty() {
            return Err(VerifyError::EmptyName("integration broker"));
        }
        if meta.cost_per_minute == 0 {
            return Err(VerifyError::ZeroCost("costPerMinute"));
        }
        if meta.cost_per_kb == 0 {
            return Err(VerifyError::ZeroCost("costPerKB"));
        }
        for triple in meta.extra_nodes.iter().flatten() {
            triple.validate()?;
        }
        for triple in meta.extra_literals.iter().flatten() {
            triple.validate()?;
        }
        crypto::verify_signature(&self.input, &self.signature, &self.hash_to_sign())
    }

    fn kind(&self) -> TxKind {
        TxKind::SensorRegistration
    }
}
