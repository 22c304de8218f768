//! Layered engine configuration.
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. TOML config file
//! 3. Environment variables (`SC_` prefix, `__` separates sections)
//!
//! Example: `SC_WATCHER__POLL_INTERVAL_MS=500` -> `watcher.poll_interval_ms`

use crate::error::{EngineError, Result};
use crate::types::{ContractRegistry, NetworkContext, ETH_ASSET_ID};
use ethers::types::Address;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SC_";

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROTOCOL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_FREE_BALANCE_TIMEOUT: u64 = 172_800;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_INCLUSION_TIMEOUT_MS: u64 = 120_000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub rpc_url: String,
    /// Hex encoded secp256k1 key used for channel signatures and chain submissions.
    pub private_key: Option<String>,
    pub contracts: NetworkContext,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { rpc_url: DEFAULT_RPC_URL.to_string(), private_key: None, contracts: NetworkContext::default() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    Memory,
    #[default]
    Rocksdb,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    pub path: PathBuf,
    /// Where `backup` writes and `restore` reads snapshots.
    pub backup_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Rocksdb,
            path: PathBuf::from("./sc-engine-db"),
            backup_path: PathBuf::from("./sc-engine-backup.bin"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolConfig {
    pub lock_timeout_ms: u64,
    pub protocol_timeout_ms: u64,
    /// Default timeout, in blocks, of every channel's free balance app.
    pub free_balance_timeout: u64,
    /// Assets a fresh free balance tracks.
    pub assets: Vec<Address>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            protocol_timeout_ms: DEFAULT_PROTOCOL_TIMEOUT_MS,
            free_balance_timeout: DEFAULT_FREE_BALANCE_TIMEOUT,
            assets: vec![ETH_ASSET_ID],
        }
    }
}

impl ProtocolConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    /// First block to scan when no checkpoint is stored.
    pub start_block: Option<u64>,
    /// Blocks a head must be buried under before its logs are processed.
    pub confirmations: u64,
    /// How long a dispute transaction may stay unmined before it counts as failed.
    pub inclusion_timeout_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            start_block: None,
            confirmations: 0,
            inclusion_timeout_ms: DEFAULT_INCLUSION_TIMEOUT_MS,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_millis(self.inclusion_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub store: StoreConfig,
    pub protocol: ProtocolConfig,
    pub watcher: WatcherConfig,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            store: StoreConfig::default(),
            protocol: ProtocolConfig::default(),
            watcher: WatcherConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            info!("loading configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::extract(Figment::from(Serialized::defaults(EngineConfig::default())).merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: EngineConfig = figment
            .extract()
            .map_err(|e| EngineError::Config(format!("config extraction failed: {e}")))?;
        config.validate()?;
        debug!(
            "configuration loaded chain_id={} rpc_url={} store={:?}",
            config.network.contracts.chain_id, config.network.rpc_url, config.store.backend
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol.protocol_timeout_ms == 0 || self.protocol.lock_timeout_ms == 0 {
            return Err(EngineError::Config("protocol and lock timeouts must be positive".into()));
        }
        if self.protocol.assets.is_empty() {
            return Err(EngineError::Config("at least one free balance asset is required".into()));
        }
        if self.watcher.poll_interval_ms == 0 || self.watcher.inclusion_timeout_ms == 0 {
            return Err(EngineError::Config("watcher poll interval and inclusion timeout must be positive".into()));
        }
        self.contract_registry().map(|_| ())
    }

    pub fn contract_registry(&self) -> Result<ContractRegistry> {
        ContractRegistry::new(&self.network.contracts)
    }
}
