use serde::{Deserialize, Serialize};

use crate::crypto::{self, Keypair};
use crate::error::VerifyError;
use crate::rdf::{LiteralTriple, NodeTriple};
use crate::transaction::{Transaction, TxKind};

/// Registers (or, for the same owner, updates) a named broker and the
/// endpoint clients reach it at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BrokerRegistration {
    /// Signer's public key; the broker's owner.
    pub input: String,
    pub counter: u64,
    pub reward_amount: u64,
    pub metadata: BrokerMetadata,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BrokerMetadata {
    /// Marketplace name of the broker, unique per the squatting rule.
    pub name: String,
    /// Network endpoint the broker serves sensor data from.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_nodes: Option<Vec<NodeTriple>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_literals: Option<Vec<LiteralTriple>>,
}

impl BrokerRegistration {
    pub fn new(
        keypair: &Keypair,
        counter: u64,
        metadata: BrokerMetadata,
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

impl Transaction for BrokerRegistration {
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
            return Err(VerifyError::EmptyName("broker name"));
        }
        if meta.endpoint.is_empty() {
            return Err(VerifyError::EmptyName("broker endpoint"));
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
        TxKind::BrokerRegistration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> BrokerMetadata {
        BrokerMetadata {
            name: "broker-a".into(),
            endpoint: "tcp://broker-a.example:9000".into(),
            extra_nodes: None,
            extra_literals: None,
        }
    }

    #[test]
    fn test_new_registration_verifies() {
        let keypair = Keypair::generate();
        let tx = BrokerRegistration::new(&keypair, 1, metadata(), 0).unwrap();
        assert!(tx.verify().is_ok());
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let keypair = Keypair::generate();
        let mut meta = metadata();
        meta.endpoint.clear();
        let err = BrokerRegistration::new(&keypair, 1, meta, 0).unwrap_err();
        assert_eq!(err, VerifyError::EmptyName("broker endpoint"));
    }

    #[test]
    fn test_tampered_metadata_fails_verification() {
        let keypair = Keypair::generate();
        let mut tx = BrokerRegistration::new(&keypair, 1, metadata(), 0).unwrap();
        tx.metadata.endpoint = "tcp://evil.example:1".into();
        assert_eq!(tx.verify(), Err(VerifyError::SignatureMismatch));
    }
}
