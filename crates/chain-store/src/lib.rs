//! # Chain Store Crate
//!
//! The authoritative chain history and the ledger state machine behind it:
//!
//! - [`state`]: the keyed ledger maps (wallets, sensors, brokers,
//!   integrations) and the undo log that makes block application exactly
//!   reversible.
//! - [`updater`]: deterministic application of a block's transactions to
//!   the ledger, the economic rulebook of the protocol.
//! - [`persistence`]: crash-safe file-backed block storage.
//! - [`service`]: the chain actor. All mutation flows through one task fed
//!   by an mpsc channel, which serializes add/replace operations and makes
//!   the multi-step reorganization safe across await points.
//! - [`miner`]: the cooperative proof-of-work loop.

pub mod miner;
pub mod persistence;
pub mod service;
pub mod state;
pub mod updater;

pub use persistence::{BlockStore, StoreError};
pub use service::{Blockchain, ChainError, ChainEvent, ChainHandle};
pub use state::{ChainLink, IntegrationExpanded, IntegrationKey, LedgerState, UndoLog, Wallet};
pub use updater::{apply_block, would_be_valid, UpdateError};
