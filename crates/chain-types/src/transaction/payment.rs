use serde::{Deserialize, Serialize};

use crate::crypto::{self, Keypair};
use crate::error::VerifyError;
use crate::transaction::{Transaction, TxKind};

/// Moves currency from the signer's wallet to one or more recipients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Payment {
    /// Signer's public key; the wallet debited.
    pub input: String,
    /// Per-wallet replay counter, strictly increasing.
    pub counter: u64,
    /// Extra reward paid to the miner of the including block.
    pub reward_amount: u64,
    pub outputs: Vec<PaymentOutput>,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PaymentOutput {
    /// Recipient wallet.
    pub public_key: String,
    pub amount: u64,
}

impl Payment {
    pub fn new(
        keypair: &Keypair,
        counter: u64,
        outputs: Vec<PaymentOutput>,
        reward_amount: u64,
    ) -> Result<Self, VerifyError> {
        let mut tx = Self {
            input: keypair.public_key(),
            counter,
            reward_amount,
            outputs,
            signature: String::new(),
        };
        tx.signature = keypair.sign(&tx.hash_to_sign());
        tx.verify()?;
        Ok(tx)
    }
}

impl Transaction for Payment {
    fn input(&self) -> &str {
        &self.input
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn hash_to_sign(&self) -> String {
        crypto::hash_data(&(self.counter, self.reward_amount, &self.outputs))
    }

    fn verify(&self) -> Result<(), VerifyError> {
        if self.counter == 0 {
            return Err(VerifyError::ZeroCounter);
        }
        if self.outputs.is_empty() {
            return Err(VerifyError::EmptyOutputs("payment"));
        }
        if self.outputs.iter().any(|o| o.amount == 0) {
            return Err(VerifyError::ZeroOutputAmount);
        }
        crypto::verify_signature(&self.input, &self.signature, &self.hash_to_sign())
    }

    fn kind(&self) -> TxKind {
        TxKind::Payment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> String {
        Keypair::generate().public_key()
    }

    #[test]
    fn test_new_payment_verifies() {
        let keypair = Keypair::generate();
        let tx = Payment::new(
            &keypair,
            1,
            vec![PaymentOutput {
                public_key: recipient(),
                amount: 10,
            }],
            0,
        )
        .unwrap();
        assert!(tx.verify().is_ok());
    }

    #[test]
    fn test_zero_counter_rejected() {
        let keypair = Keypair::generate();
        let err = Payment::new(
            &keypair,
            0,
            vec![PaymentOutput {
                public_key: recipient(),
                amount: 10,
            }],
            0,
        )
        .unwrap_err();
        assert_eq!(err, VerifyError::ZeroCounter);
    }

    #[test]
    fn test_empty_outputs_rejected() {
        let keypair = Keypair::generate();
        let err = Payment::new(&keypair, 1, vec![], 0).unwrap_err();
        assert_eq!(err, VerifyError::EmptyOutputs("payment"));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let keypair = Keypair::generate();
        let err = Payment::new(
            &keypair,
            1,
            vec![PaymentOutput {
                public_key: recipient(),
                amount: 0,
            }],
            0,
        )
        .unwrap_err();
        assert_eq!(err, VerifyError::ZeroOutputAmount);
    }

    #[test]
    fn test_tampered_amount_fails_verification() {
        let keypair = Keypair::generate();
        let mut tx = Payment::new(
            &keypair,
            1,
            vec![PaymentOutput {
                public_key: recipient(),
                amount: 10,
            }],
            0,
        )
        .unwrap();
        tx.outputs[0].amount = 1000;
        assert_eq!(tx.verify(), Err(VerifyError::SignatureMismatch));
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let keypair = Keypair::generate();
        let tx = Payment::new(
            &keypair,
            1,
            vec![PaymentOutput {
                public_key: recipient(),
                amount: 10,
            }],
            5,
        )
        .unwrap();
        let value = serde_json::to_value(&tx).unwrap();
        assert!(value.get("rewardAmount").is_some());
        assert!(value["outputs"][0].get("publicKey").is_some());
        let back: Payment = serde_json::from_value(value).unwrap();
        assert_eq!(back, tx);
    }
}
