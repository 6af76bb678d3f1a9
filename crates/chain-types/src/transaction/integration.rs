use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Keypair};
use crate::error::VerifyError;
use crate::transaction::{Transaction, TxKind};

/// Opens a data purchase: escrows currency per sensor and nominates a set
/// of witness brokers that will vote on delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Integration {
    /// Signer's public key; the buyer, and the escrow refund target.
    pub input: String,
    pub counter: u64,
    pub reward_amount: u64,
    /// How many witnesses to draw from the broker registry.
    pub witness_count: u64,
    pub outputs: Vec<IntegrationOutput>,
    pub signature: String,
}

/// One escrowed purchase of a single sensor's data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IntegrationOutput {
    /// Amount locked in escrow for this sensor.
    pub amount: u64,
    pub sensor_name: String,
    /// Hash of the sensor registration the buyer saw. Pinning it means a
    /// re-registration between quote and purchase invalidates the buy.
    pub sensor_hash: String,
    /// Hash of the broker registration serving that sensor, pinned for the
    /// same reason.
    pub broker_hash: String,
}

impl Integration {
    pub fn new(
        keypair: &Keypair,
        counter: u64,
        outputs: Vec<IntegrationOutput>,
        witness_count: u64,
        reward_amount: u64,
    ) -> Result<Self, VerifyError> {
        let mut tx = Self {
            input: keypair.public_key(),
            counter,
            reward_amount,
            witness_count,
            outputs,
            signature: String::new(),
        };
        tx.signature = keypair.sign(&tx.hash_to_sign());
        tx.verify()?;
        Ok(tx)
    }

    /// Draw this integration's witnesses from the registered broker names.
    ///
    /// The draw is part of consensus: every node must pick the same set.
    /// The pool is sorted so the outcome is independent of registry
    /// iteration order, and the PRNG is seeded from the transaction's own
    /// signature and hash, which are fixed once it is signed.
    pub fn choose_witnesses(&self, broker_names: &[String]) -> Result<Vec<String>, VerifyError> {
        let mut pool: Vec<String> = broker_names.to_vec();
        pool.sort_unstable();

        if self.witness_count > pool.len() as u64 {
            return Err(VerifyError::NotEnoughBrokers {
                requested: self.witness_count,
                available: pool.len() as u64,
            });
        }
        if self.witness_count == pool.len() as u64 {
            return Ok(pool);
        }

        let seed = crypto::hash_seed(&format!("{}{}", self.signature, self.hash_to_sign()));
        let mut rng = ChaCha20Rng::from_seed(seed);
        let mut chosen = Vec::with_capacity(self.witness_count as usize);
        for _ in 0..self.witness_count {
            let idx = rng.gen_range(0..pool.len());
            chosen.push(pool.swap_remove(idx));
        }
        Ok(chosen)
    }
}

impl Transaction for Integration {
    fn input(&self) -> &str {
        &self.input
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn hash_to_sign(&self) -> String {
        crypto::hash_data(&(
            self.counter,
            self.reward_amount,
            self.witness_count,
            &self.outputs,
        ))
    }

    fn verify(&self) -> Result<(), VerifyError> {
        if self.counter == 0 {
            return Err(VerifyError::ZeroCounter);
        }
        if self.outputs.is_empty() {
            return Err(VerifyError::EmptyOutputs("integration"));
        }
        if self.outputs.iter().any(|o| o.amount == 0) {
            return Err(VerifyError::ZeroOutputAmount);
        }
        crypto::verify_signature(&self.input, &self.signature, &self.hash_to_sign())
    }

    fn kind(&self) -> TxKind {
        TxKind::Integration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output() -> IntegrationOutput {
        IntegrationOutput {
            amount: 25,
            sensor_name: "outside-thermometer".into(),
            sensor_hash: "aa".repeat(32),
            broker_hash: "bb".repeat(32),
        }
    }

    fn brokers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("broker-{i}")).collect()
    }

    #[test]
    fn test_new_integration_verifies() {
        let keypair = Keypair::generate();
        let tx = Integration::new(&keypair, 1, vec![output()], 1, 0).unwrap();
        assert!(tx.verify().is_ok());
    }

    #[test]
    fn test_witness_draw_is_deterministic() {
        let keypair = Keypair::generate();
        let tx = Integration::new(&keypair, 1, vec![output()], 3, 0).unwrap();
        let names = brokers(10);
        assert_eq!(
            tx.choose_witnesses(&names).unwrap(),
            tx.choose_witnesses(&names).unwrap()
        );
    }

    #[test]
    fn test_witness_draw_ignores_registry_order() {
        let keypair = Keypair::generate();
        let tx = Integration::new(&keypair, 1, vec![output()], 3, 0).unwrap();
        let names = brokers(10);
        let mut shuffled = names.clone();
        shuffled.reverse();
        let mut a = tx.choose_witnesses(&names).unwrap();
        let mut b = tx.choose_witnesses(&shuffled).unwrap();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }

    #[test]
    fn test_witness_draw_all_brokers_when_counts_match() {
        let keypair = Keypair::generate();
        let tx = Integration::new(&keypair, 1, vec![output()], 4, 0).unwrap();
        let mut expected = brokers(4);
        expected.sort_unstable();
        assert_eq!(tx.choose_witnesses(&brokers(4)).unwrap(), expected);
    }

    #[test]
    fn test_too_few_brokers_rejected() {
        let keypair = Keypair::generate();
        let tx = Integration::new(&keypair, 1, vec![output()], 5, 0).unwrap();
        assert_eq!(
            tx.choose_witnesses(&brokers(2)),
            Err(VerifyError::NotEnoughBrokers {
                requested: 5,
                available: 2
            })
        );
    }

    #[test]
    fn test_distinct_integrations_draw_differently() {
        // Not guaranteed in theory, but with ten brokers and different
        // seeds a collision across all three picks is vanishingly rare.
        let keypair = Keypair::generate();
        let a = Integration::new(&keypair, 1, vec![output()], 3, 0).unwrap();
        let b = Integration::new(&keypair, 2, vec![output()], 3, 0).unwrap();
        let names = brokers(10);
        assert_ne!(
            a.choose_witnesses(&names).unwrap(),
            b.choose_witnesses(&names).unwrap()
        );
    }
}
