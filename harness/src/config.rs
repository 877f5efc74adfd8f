//! Harness configuration: which node to drive, where the fork replays from,
//! and the static setup data (registry, proxy factory, assets, prices).
//!
//! Configuration is plain data built in code with the `with_*` builders,
//! loaded from a TOML file, or overridden from the environment.

use crate::assets::AssetInfo;
use crate::error::{HarnessError, Result};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Network the fork replays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Ethereum mainnet
    Mainnet,
    /// OP mainnet
    Optimism,
    /// Arbitrum One
    Arbitrum,
    /// Base
    Base,
    /// Any other EVM chain
    Custom,
}

impl Network {
    /// Chain id the forked node should report
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Network::Mainnet => Some(1),
            Network::Optimism => Some(10),
            Network::Arbitrum => Some(42161),
            Network::Base => Some(8453),
            Network::Custom => None,
        }
    }

    /// Human-readable network name
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Optimism => "optimism",
            Network::Arbitrum => "arbitrum",
            Network::Base => "base",
            Network::Custom => "custom",
        }
    }
}

/// Which node flavour serves the cheat methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheatcodeDialect {
    /// `hardhat_*` methods (Hardhat Network; also understood by Anvil)
    Hardhat,
    /// `anvil_*` methods
    Anvil,
}

impl CheatcodeDialect {
    /// Full JSON-RPC method name for a cheat such as `reset` or `setStorageAt`
    pub fn method(&self, name: &str) -> String {
        match self {
            CheatcodeDialect::Hardhat => format!("hardhat_{}", name),
            CheatcodeDialect::Anvil => format!("anvil_{}", name),
        }
    }
}

/// Configuration for the fork harness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Network being forked
    pub network: Network,

    /// JSON-RPC endpoint of the local fork node
    pub node_url: String,

    /// Archive endpoint the fork replays state from
    pub upstream_url: String,

    /// Block to pin on connect (None keeps whatever the node was started with)
    pub fork_block: Option<u64>,

    /// Cheat method namespace
    pub dialect: CheatcodeDialect,

    /// Name registry contract
    pub registry_address: Address,

    /// Account allowed to write the registry
    pub registry_owner: Address,

    /// Proxy factory contract (`proxies` / `build`)
    pub proxy_registry: Address,

    /// Exchange wrapper allowlist (`addWrapper` / `isWrapper`)
    pub wrapper_registry: Address,

    /// Account allowed to extend the wrapper allowlist
    pub wrapper_registry_owner: Address,

    /// Account that sends deployments
    pub deployer: Address,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// First receipt poll interval (in milliseconds)
    pub receipt_poll_interval_ms: u64,

    /// Receipt wait limit (in seconds)
    pub receipt_timeout_secs: u64,

    /// Gas limit attached to every harness transaction
    pub gas_limit: u64,

    /// Native balance written when topping up a sender (in wei)
    pub top_up_wei: U256,

    /// Dry-run actions with `eth_call` before sending them
    pub simulate_before_send: bool,

    /// Upper bound on slot indices probed by the balance forger
    pub max_probe_slots: u64,

    /// Directory holding compiled contract artifacts
    pub artifacts_dir: Option<PathBuf>,

    /// Known assets
    pub assets: Vec<AssetInfo>,

    /// Static USD unit prices keyed by symbol
    pub prices: HashMap<String, String>,
}

impl HarnessConfig {
    /// Create a configuration for the given network against a local node
    pub fn new(network: Network) -> Self {
        Self {
            network,
            node_url: "http://127.0.0.1:8545".to_string(),
            upstream_url: String::new(),
            fork_block: None,
            dialect: CheatcodeDialect::Hardhat,
            registry_address: Address::zero(),
            registry_owner: Address::zero(),
            proxy_registry: Address::zero(),
            wrapper_registry: Address::zero(),
            wrapper_registry_owner: Address::zero(),
            deployer: Address::zero(),
            request_timeout: Duration::from_secs(30),
            receipt_poll_interval_ms: 50,
            receipt_timeout_secs: 60,
            gas_limit: 10_000_000,
            // 100 ETH
            top_up_wei: U256::exp10(20),
            simulate_before_send: true,
            max_probe_slots: 100,
            artifacts_dir: None,
            assets: Vec::new(),
            prices: HashMap::new(),
        }
    }

    /// Create configuration for a mainnet fork
    pub fn mainnet() -> Self {
        Self::new(Network::Mainnet)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content)
            .map_err(|e| HarnessError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Apply `FORK_NODE_URL`, `FORK_UPSTREAM_URL`, `FORK_BLOCK` and `FORK_REGISTRY`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("FORK_NODE_URL") {
            self.node_url = url;
        }
        if let Ok(url) = std::env::var("FORK_UPSTREAM_URL") {
            self.upstream_url = url;
        }
        if let Ok(block) = std::env::var("FORK_BLOCK") {
            let block = block
                .parse::<u64>()
                .map_err(|e| HarnessError::ConfigError(format!("FORK_BLOCK: {}", e)))?;
            self.fork_block = Some(block);
        }
        if let Ok(addr) = std::env::var("FORK_REGISTRY") {
            self.registry_address = addr
                .parse::<Address>()
                .map_err(|e| HarnessError::ConfigError(format!("FORK_REGISTRY: {}", e)))?;
        }
        Ok(self)
    }

    /// Set the fork node endpoint
    pub fn with_node_url(mut self, url: impl Into<String>) -> Self {
        self.node_url = url.into();
        self
    }

    /// Set the upstream archive endpoint and the block to pin on connect
    pub fn with_fork(mut self, upstream_url: impl Into<String>, block: Option<u64>) -> Self {
        self.upstream_url = upstream_url.into();
        self.fork_block = block;
        self
    }

    /// Set the cheat method namespace
    pub fn with_dialect(mut self, dialect: CheatcodeDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set registry address and owner
    pub fn with_registry(mut self, registry: Address, owner: Address) -> Self {
        self.registry_address = registry;
        self.registry_owner = owner;
        self
    }

    /// Set the proxy factory
    pub fn with_proxy_registry(mut self, proxy_registry: Address) -> Self {
        self.proxy_registry = proxy_registry;
        self
    }

    /// Set the exchange wrapper allowlist and its owner
    pub fn with_wrapper_registry(mut self, registry: Address, owner: Address) -> Self {
        self.wrapper_registry = registry;
        self.wrapper_registry_owner = owner;
        self
    }

    /// Set the deployment sender
    pub fn with_deployer(mut self, deployer: Address) -> Self {
        self.deployer = deployer;
        self
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set receipt polling configuration
    pub fn with_receipt_config(mut self, poll_interval_ms: u64, timeout_secs: u64) -> Self {
        self.receipt_poll_interval_ms = poll_interval_ms;
        self.receipt_timeout_secs = timeout_secs;
        self
    }

    /// Set whether actions are dry-run before sending
    pub fn with_simulation(mut self, simulate: bool) -> Self {
        self.simulate_before_send = simulate;
        self
    }

    /// Set the slot probing bound
    pub fn with_max_probe_slots(mut self, slots: u64) -> Self {
        self.max_probe_slots = slots;
        self
    }

    /// Set the artifacts directory
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    /// Add a known asset
    pub fn with_asset(mut self, asset: AssetInfo) -> Self {
        self.assets.push(asset);
        self
    }

    /// Add a static USD price
    pub fn with_price(mut self, symbol: impl Into<String>, price: impl Into<String>) -> Self {
        self.prices.insert(symbol.into(), price.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_url.is_empty() {
            return Err(HarnessError::ConfigError(
                "Node URL cannot be empty".to_string(),
            ));
        }
        Url::parse(&self.node_url)?;
        if !self.upstream_url.is_empty() {
            Url::parse(&self.upstream_url)?;
        }
        if self.fork_block.is_some() && self.upstream_url.is_empty() {
            return Err(HarnessError::ConfigError(
                "Fork block set without an upstream URL".to_string(),
            ));
        }
        if self.registry_address.is_zero() {
            return Err(HarnessError::ConfigError(
                "Registry address must be set".to_string(),
            ));
        }
        if self.proxy_registry.is_zero() {
            return Err(HarnessError::ConfigError(
                "Proxy registry address must be set".to_string(),
            ));
        }
        if !self.wrapper_registry.is_zero() && self.wrapper_registry_owner.is_zero() {
            return Err(HarnessError::ConfigError(
                "Wrapper registry set without an owner".to_string(),
            ));
        }
        if self.deployer.is_zero() {
            return Err(HarnessError::ConfigError(
                "Deployer address must be set".to_string(),
            ));
        }
        if self.receipt_poll_interval_ms == 0 {
            return Err(HarnessError::ConfigError(
                "Receipt poll interval must be greater than 0".to_string(),
            ));
        }
        if self.receipt_timeout_secs == 0 {
            return Err(HarnessError::ConfigError(
                "Receipt timeout must be greater than 0".to_string(),
            ));
        }
        if self.gas_limit == 0 {
            return Err(HarnessError::ConfigError(
                "Gas limit must be greater than 0".to_string(),
            ));
        }
        if self.top_up_wei.is_zero() {
            return Err(HarnessError::ConfigError(
                "Top-up amount must be greater than 0".to_string(),
            ));
        }
        if self.max_probe_slots == 0 {
            return Err(HarnessError::ConfigError(
                "Max probe slots must be greater than 0".to_string(),
            ));
        }
        for asset in &self.assets {
            asset.validate()?;
        }

        Ok(())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}
