//! Protocol constants.
//!
//! These are consensus parameters: changing any of them forks the chain.

/// Difficulty of the genesis block, and the floor a new chain starts from.
pub const MINE_DIFFICULTY: u32 = 3;

/// Target block interval in milliseconds. Drives difficulty retargeting.
pub const MINE_RATE: u64 = 3000;

/// Fixed subsidy credited to a block's reward address before any
/// transaction is applied.
pub const MINING_REWARD: u64 = 50;

/// Reserved URI namespace. Registration metadata triples may not use this
/// prefix for subjects, predicates or node-valued objects.
pub const RESERVED_URI_PREFIX: &str = "sensornet://";

/// Roughly one day's worth of blocks at the target interval. Blocks older
/// than this fall out of the in-memory window and can no longer serve as
/// reorganization divergence points.
pub const MAX_BLOCKS_IN_MEMORY: usize = (24 * 60 * 60 * 1000 / MINE_RATE) as usize;

/// `lastHash` sentinel of the genesis block.
pub const GENESIS_LAST_HASH: &str = "-----";

/// Fixed hash of the genesis block. Never recomputed, never checked
/// against proof-of-work.
pub const GENESIS_HASH: &str = "genesis-hash";
