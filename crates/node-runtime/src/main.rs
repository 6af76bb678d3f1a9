//! The sensornet node binary.
//!
//! Opens the block store, starts the propagation server, feeds peer
//! transactions into the mempool, and optionally runs a mining loop.

mod config;
mod mempool;
mod telemetry;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{info, warn};

use chain_propagation::{PropConfig, PropServer};
use chain_store::miner::mine_block;
use chain_store::service::{Blockchain, ChainHandle};
use chain_types::Keypair;

use crate::config::Config;
use crate::mempool::Mempool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::default(),
    };
    let reward = config.reward_keypair()?;
    info!(reward = %reward.public_key(), "node starting");

    let (chain, _chain_task) = Blockchain::open(config.chain_dir.clone()).await?;
    info!(length = chain.length().await?, "chain ready");

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let prop = PropServer::new(
        chain.clone(),
        PropConfig {
            send_wait: config.send_wait(),
            advertised_address: config.advertised_address.clone(),
        },
        Some(incoming_tx),
    );
    let listen = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    prop.start(listen, &config.peers).await?;

    let mempool = Arc::new(Mutex::new(Mempool::default()));
    spawn_mempool_feed(Arc::clone(&mempool), incoming_rx);
    spawn_mempool_prune(Arc::clone(&mempool), chain.clone());

    if config.mine {
        start_mining(chain.clone(), Arc::clone(&mempool), reward).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

/// Pool every transaction first heard from a peer.
fn spawn_mempool_feed(
    mempool: Arc<Mutex<Mempool>>,
    mut incoming: mpsc::UnboundedReceiver<chain_types::TransactionSet>,
) {
    tokio::spawn(async move {
        while let Some(txs) = incoming.recv().await {
            mempool.lock().await.add(txs);
        }
    });
}

/// Re-check the pool against ledger state after every head change.
fn spawn_mempool_prune(mempool: Arc<Mutex<Mempool>>, chain: ChainHandle) {
    let mut events = chain.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Err(e) = mempool.lock().await.prune(&chain).await {
                        warn!(error = %e, "mempool prune stopped");
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

/// Run the mining loop: assemble a batch from the pool, grind until a
/// block lands or the head moves, repeat.
async fn start_mining(
    chain: ChainHandle,
    mempool: Arc<Mutex<Mempool>>,
    reward: Keypair,
) -> anyhow::Result<()> {
    let head = chain.block(chain.length().await? - 1).await?;
    let (head_tx, head_rx) = watch::channel(head.hash.clone());

    // Keep the watch pointing at the committed head so in-flight mining
    // rounds abandon stale work.
    {
        let chain = chain.clone();
        let mut events = chain.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(block) = event.blocks.last() {
                            let _ = head_tx.send(block.hash.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Ok(len) = chain.length().await else { return };
                        match chain.block(len - 1).await {
                            Ok(block) => {
                                let _ = head_tx.send(block.hash);
                            }
                            Err(e) => {
                                warn!(error = %e, "head watch stopped");
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    let reward = reward.public_key();
    tokio::spawn(async move {
        loop {
            let last = match chain.length().await {
                Ok(len) => match chain.block(len - 1).await {
                    Ok(block) => block,
                    Err(e) => {
                        warn!(error = %e, "mining loop stopped");
                        return;
                    }
                },
                Err(_) => return,
            };
            let batch = match mempool.lock().await.next_batch(&chain, &reward).await {
                Ok(batch) => batch,
                Err(_) => return,
            };
            // None means the head moved mid-round; loop around and mine
            // on the new head.
            if let Some(block) = mine_block(&last, reward.clone(), batch, head_rx.clone()).await {
                if let Err(e) = chain.add_block(block).await {
                    warn!(error = %e, "mined block rejected");
                }
            }
        }
    });
    Ok(())
}
