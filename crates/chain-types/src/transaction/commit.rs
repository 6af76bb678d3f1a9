use serde::{Deserialize, Serialize};

use crate::crypto::{self, Keypair};
use crate::error::VerifyError;
use crate::transaction::{Transaction, TxKind};

/// A witness broker's vote that an integration's data was delivered.
///
/// Commits carry no counter: a given witness can vote at most once per
/// integration, and the updater enforces that by recording the vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Commit {
    /// Signer's public key; must own the named broker.
    pub input: String,
    /// The witness broker casting the vote.
    pub broker_name: String,
    /// The integration being voted on.
    pub integration: IntegrationRef,
    pub signature: String,
}

/// Identifies an integration by its buyer and that buyer's counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IntegrationRef {
    /// The buyer's public key.
    pub input: String,
    /// The buyer's counter on the integration transaction.
    pub counter: u64,
}

impl Commit {
    pub fn new(
        keypair: &Keypair,
        broker_name: impl Into<String>,
        integration: IntegrationRef,
    ) -> Result<Self, VerifyError> {
        let mut tx = Self {
            input: keypair.public_key(),
            broker_name: broker_name.into(),
            integration,
            signature: String::new(),
        };
        tx.signature = keypair.sign(&tx.hash_to_sign());
        tx.verify()?;
        Ok(tx)
    }
}

impl Transaction for Commit {
    fn input(&self) -> &str {
        &self.input
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn hash_to_sign(&self) -> String {
        crypto::hash_data(&(&self.input, &self.broker_name, &self.integration))
    }

    fn verify(&self) -> Result<(), VerifyError> {
        if self.broker_name.is_empty() {
            return Err(VerifyError::EmptyName("broker name"));
        }
        if self.integration.counter == 0 {
            return Err(VerifyError::ZeroCounter);
        }
        crypto::verify_signature(&self.input, &self.signature, &self.hash_to_sign())
    }

    fn kind(&self) -> TxKind {
        TxKind::Commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integration_ref() -> IntegrationRef {
        IntegrationRef {
            input: Keypair::generate().public_key(),
            counter: 1,
        }
    }

    #[test]
    fn test_new_commit_verifies() {
        let keypair = Keypair::generate();
        let tx = Commit::new(&keypair, "broker-a", integration_ref()).unwrap();
        assert!(tx.verify().is_ok());
    }

    #[test]
    fn test_empty_broker_name_rejected() {
        let keypair = Keypair::generate();
        let err = Commit::new(&keypair, "", integration_ref()).unwrap_err();
        assert_eq!(err, VerifyError::EmptyName("broker name"));
    }

    #[test]
    fn test_tampered_target_fails_verification() {
        let keypair = Keypair::generate();
        let mut tx = Commit::new(&keypair, "broker-a", integration_ref()).unwrap();
        tx.integration.counter = 9;
        assert_eq!(tx.verify(), Err(VerifyError::SignatureMismatch));
    }
}
