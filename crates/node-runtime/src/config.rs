//! Node configuration, loaded from a JSON file named on the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use chain_types::Keypair;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Directory the block store lives in.
    #[serde(default = "default_chain_dir")]
    pub chain_dir: PathBuf,
    /// Port the propagation listener binds; 0 picks an ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Peers to dial at startup, as `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Address other nodes can reach us at, announced in handshakes.
    #[serde(default)]
    pub advertised_address: Option<String>,
    /// Mine blocks when true.
    #[serde(default)]
    pub mine: bool,
    /// Hex secret key mining rewards are paid to. Generated fresh when
    /// absent, which is only useful for throwaway nodes.
    #[serde(default)]
    pub reward_key: Option<String>,
    /// Milliseconds between receiving and replying on peer connections.
    #[serde(default = "default_send_wait_ms")]
    pub send_wait_ms: u64,
}

fn default_chain_dir() -> PathBuf {
    PathBuf::from("./chain")
}

fn default_listen_port() -> u16 {
    9344
}

fn default_send_wait_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain_dir: default_chain_dir(),
            listen_port: default_listen_port(),
            peers: Vec::new(),
            advertised_address: None,
            mine: false,
            reward_key: None,
            send_wait_ms: default_send_wait_ms(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("couldn't read config file {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("couldn't parse config file {}", path.display()))
    }

    pub fn send_wait(&self) -> Duration {
        Duration::from_millis(self.send_wait_ms)
    }

    /// The keypair block rewards go to.
    pub fn reward_keypair(&self) -> anyhow::Result<Keypair> {
        match &self.reward_key {
            Some(hex) => Keypair::from_hex(hex).context("invalid rewardKey in config"),
            None => Ok(Keypair::generate()),
        }
    }
}
