//! Crash-safe file-backed block storage.
//!
//! One JSON file per block (`{i}.json`) plus a `meta.json` carrying the
//! block count and, while a suffix rewrite is in flight, a rollback
//! marker. Rewrites stage the files they will overwrite as
//! `rollback_{i}.json` before touching anything, so a crash at any point
//! leaves either the old chain or the new chain recoverable. `open`
//! finishes an interrupted rewrite by restoring the staged files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use chain_types::Block;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block {0} is not persisted")]
    MissingBlock(usize),

    #[error("write at {start} would leave a gap (store holds {count} blocks)")]
    WriteGap { start: usize, count: usize },

    #[error("a failed rewrite is still pending recovery")]
    RecoveryPending,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Meta {
    block_count: usize,
    rollback: Option<Rollback>,
}

/// Marker for an in-flight suffix rewrite: blocks `from..from + count`
/// have staged copies under `rollback_{i}.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Rollback {
    from: usize,
    count: usize,
}

/// Directory-backed block storage.
pub struct BlockStore {
    dir: PathBuf,
    meta: Meta,
}

impl BlockStore {
    /// Open (creating if needed) a store, restoring any interrupted
    /// rewrite first.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let meta_path = dir.join("meta.json");
        let mut meta = match fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Meta {
                block_count: 0,
                rollback: None,
            },
            Err(e) => return Err(e.into()),
        };

        if let Some(rollback) = meta.rollback.take() {
            warn!(
                from = rollback.from,
                count = rollback.count,
                "restoring interrupted block rewrite"
            );
            for i in rollback.from..rollback.from + rollback.count {
                fs::rename(staged_path(&dir, i), block_path(&dir, i)).await?;
            }
            let mut store = Self { dir, meta };
            store.write_meta().await?;
            return Ok(store);
        }

        Ok(Self { dir, meta })
    }

    pub fn block_count(&self) -> usize {
        self.meta.block_count
    }

    pub async fn read_block(&self, i: usize) -> Result<Block, StoreError> {
        if i >= self.meta.block_count {
            return Err(StoreError::MissingBlock(i));
        }
        let bytes = fs::read(block_path(&self.dir, i)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write `blocks` at indices `start..`, replacing any existing suffix.
    /// `start` must not exceed the current count. Overwritten blocks are
    /// staged first so an interrupted call is recoverable on reopen.
    pub async fn write_blocks(&mut self, start: usize, blocks: &[Block]) -> Result<(), StoreError> {
        if let Some(rollback) = self.meta.rollback {
            // An earlier rewrite failed and its abort couldn't finish.
            // Retry the restore before touching anything else.
            self.abort_rewrite(rollback.from, rollback.count).await;
            if self.meta.rollback.is_some() {
                return Err(StoreError::RecoveryPending);
            }
        }

        let count = self.meta.block_count;
        if start > count {
            return Err(StoreError::WriteGap { start, count });
        }
        if blocks.is_empty() {
            return Ok(());
        }

        let overwritten = count - start;
        if overwritten > 0 {
            for i in start..count {
                fs::copy(block_path(&self.dir, i), staged_path(&self.dir, i)).await?;
            }
            self.meta.rollback = Some(Rollback {
                from: start,
                count: overwritten,
            });
            self.write_meta().await?;
        }

        for (offset, block) in blocks.iter().enumerate() {
            let result = match serde_json::to_vec(block) {
                Ok(bytes) => fs::write(block_path(&self.dir, start + offset), bytes)
                    .await
                    .map_err(StoreError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                if overwritten > 0 {
                    self.abort_rewrite(start, overwritten).await;
                }
                return Err(e);
            }
        }

        self.meta.block_count = start + blocks.len();
        self.meta.rollback = None;
        self.write_meta().await?;

        for i in start..start + overwritten {
            if let Err(e) = fs::remove_file(staged_path(&self.dir, i)).await {
                // Stale staged files are harmless once the marker is gone.
                debug!(index = i, error = %e, "couldn't remove staged block copy");
            }
        }
        debug!(
            start,
            written = blocks.len(),
            total = self.meta.block_count,
            "persisted blocks"
        );
        Ok(())
    }

    /// A rewrite failed partway: copy the staged originals back over the
    /// candidate files, then clear the marker. The staged copies are kept
    /// until the marker is gone, so if any step here fails the marker
    /// stays set and `open` finishes the restore on the next start.
    async fn abort_rewrite(&mut self, from: usize, count: usize) {
        for i in from..from + count {
            if let Err(e) = fs::copy(staged_path(&self.dir, i), block_path(&self.dir, i)).await {
                warn!(index = i, error = %e, "couldn't restore staged block, reopen will");
                return;
            }
        }
        self.meta.rollback = None;
        if let Err(e) = self.write_meta().await {
            self.meta.rollback = Some(Rollback { from, count });
            warn!(error = %e, "couldn't clear rollback marker, reopen will");
            return;
        }
        for i in from..from + count {
            if let Err(e) = fs::remove_file(staged_path(&self.dir, i)).await {
                debug!(index = i, error = %e, "couldn't remove staged block copy");
            }
        }
        warn!(from, count, "rewrite aborted, original suffix restored");
    }

    /// Meta updates go through a temp file and rename so the marker file
    /// is never observed half-written.
    async fn write_meta(&mut self) -> Result<(), StoreError> {
        let tmp = self.dir.join("meta.json.tmp");
        fs::write(&tmp, serde_json::to_vec(&self.meta)?).await?;
        fs::rename(&tmp, self.dir.join("meta.json")).await?;
        Ok(())
    }
}

fn block_path(dir: &Path, i: usize) -> PathBuf {
    dir.join(format!("{i}.json"))
}

fn staged_path(dir: &Path, i: usize) -> PathBuf {
    dir.join(format!("rollback_{i}.json"))
}
