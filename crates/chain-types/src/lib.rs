//! # Chain Types Crate
//!
//! Value types shared by every sensornet subsystem: the five transaction
//! variants, the proof-of-work sealed [`Block`], RDF triple metadata, and
//! the cryptographic helpers (canonical hashing, ECDSA keys/signatures)
//! they are built on.
//!
//! All types here are plain data: construction self-verifies, `verify` is
//! a pure function of the fields, and nothing in this crate touches chain
//! state. Economic validation lives in `chain-store`.

pub mod block;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod rdf;
pub mod transaction;

pub use block::Block;
pub use constants::*;
pub use crypto::Keypair;
pub use error::VerifyError;
pub use transaction::{
    BrokerRegistration, Commit, Integration, IntegrationOutput, Payment, PaymentOutput,
    SensorRegistration, Transaction, TransactionSet, TxKind,
};
