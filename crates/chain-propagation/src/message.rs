//! The wire message and its errors.

use serde::{Deserialize, Serialize};

use chain_store::service::ChainError;
use chain_types::{Block, TransactionSet, VerifyError};

/// One simplex turn's payload. Every field is optional; an empty message
/// is a valid turn and just passes the right to speak back to the peer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<Subscription>,
    /// The sender's own reachable address, for peers to learn about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainSegment>,
    /// New transactions grouped under their kind names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txs: Option<TransactionSet>,
}

impl PropMessage {
    pub fn is_empty(&self) -> bool {
        self.sub.is_none() && self.address.is_none() && self.chain.is_none() && self.txs.is_none()
    }
}

/// What the sender wants pushed to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Subscription {
    pub txs: bool,
}

/// A run of blocks starting at chain index `start`; the sender believes
/// the receiver's chain matches its own before that point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSegment {
    pub start: usize,
    pub blocks: Vec<Block>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unparseable message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("peer sent invalid data: {0}")]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("peer broke the simplex protocol: {0}")]
    Protocol(&'static str),

    #[error("timed out waiting for the peer")]
    RecvTimeout,

    #[error("peer closed the connection")]
    PeerClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_message_is_bare_object() {
        let msg = PropMessage::default();
        assert_eq!(serde_json::to_string(&msg).unwrap(), "{}");
        let back: PropMessage = serde_json::from_str("{}").unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_tx_groups_use_kind_names() {
        use chain_types::transaction::{Payment, PaymentOutput};
        use chain_types::Keypair;

        let keypair = Keypair::generate();
        let pay = Payment::new(
            &keypair,
            1,
            vec![PaymentOutput {
                public_key: keypair.public_key(),
                amount: 1,
            }],
            0,
        )
        .unwrap();
        let mut txs = TransactionSet::default();
        txs.payments.push(pay);
        let msg = PropMessage {
            txs: Some(txs),
            ..PropMessage::default()
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value["txs"].get("Payment").is_some());
        assert!(value["txs"].get("payments").is_none());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(serde_json::from_str::<PropMessage>(r#"{"bogus":1}"#).is_err());
    }
}
