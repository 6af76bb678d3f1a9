//! # Chain Propagation Crate
//!
//! The peer-to-peer protocol that keeps nodes converged: newline-delimited
//! JSON messages over TCP, exchanged in strict simplex turns. Each side
//! sends one message, then waits for the peer's reply before it may send
//! again; the acceptor of a connection speaks first. Messages carry a
//! transaction subscription flag, an optional reachable address, a chain
//! segment from the sender's estimate of where the receiver diverges, and
//! batches of new transactions.
//!
//! [`PropServer`] owns the listener, the outbound peers (with exponential
//! backoff redial), the global seen-transaction set, and fan-out of local
//! chain changes and transactions to every live connection.

pub mod connection;
pub mod message;
pub mod server;

pub use connection::PropConfig;
pub use message::{ChainSegment, PropMessage, Subscription, WireError};
pub use server::PropServer;
