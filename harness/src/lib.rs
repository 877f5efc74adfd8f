//! DeFi Fork Harness
//!
//! This library drives a local fork node (Hardhat Network or Anvil) to run
//! protocol actions against pinned, repeatable chain state. It pins the fork to
//! a historical block, snapshots and rewinds ledger state between test cases,
//! deploys and registers contracts by logical name, impersonates accounts,
//! forges token balances through direct storage writes, executes actions
//! through per-owner proxies and sizes amounts in USD.
//!
//! # Features
//!
//! - **Fork Control**: Pin and re-pin the fork to any upstream block
//! - **Snapshots**: Single-use restore points with stack semantics
//! - **Registry**: Fresh deployments registered under stable names
//! - **Impersonation**: Send transactions as any account on the fork
//! - **Balance Forging**: Storage-slot writes with slot discovery and read-back checks
//! - **Actions**: Typed action parameters, atomic recipes, verbatim revert reasons
//! - **USD Amounts**: Dollar notionals converted to token base units
//! - **Exchange Orders**: Wrapper allowlisting and mock-wrapper sell orders
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fork_harness::{ForkHarness, FsArtifactStore, HarnessConfig, StaticPriceTable};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     fork_harness::init_tracing();
//!
//!     let config = HarnessConfig::from_file("harness.toml")?.with_env_overrides()?;
//!     let prices = StaticPriceTable::new(config.prices.clone());
//!     let artifacts = FsArtifactStore::new("artifacts");
//!
//!     let mut harness =
//!         ForkHarness::connect(Arc::new(config), Arc::new(artifacts), Arc::new(prices)).await?;
//!
//!     let snapshot = harness.take_snapshot().await?;
//!     // stage, act, assert
//!     harness.revert_to_snapshot(snapshot).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Examples
//!
//! ## Supply through a proxy
//!
//! ```rust,no_run
//! use fork_harness::{Action, ForkHarness};
//! use ethers::types::Address;
//!
//! # async fn run(harness: &mut ForkHarness, market: Address, user: Address) -> fork_harness::Result<()> {
//! let weth = harness.asset("WETH")?.clone();
//! let amount = harness.fetch_amount_in_usd_price("WETH", "10000").await?;
//!
//! harness.set_balance(weth.address, user, amount.base_units).await?;
//! let proxy = harness.get_proxy(user).await?;
//! harness.approve(weth.address, proxy.address, user).await?;
//!
//! harness
//!     .execute_action(
//!         user,
//!         &Action::AaveSupply {
//!             market,
//!             asset: weth.address,
//!             amount: amount.base_units,
//!             from: user,
//!             on_behalf_of: Address::zero(),
//!             enable_as_coll: true,
//!         },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Upgrade an action by name
//!
//! ```rust,no_run
//! use fork_harness::ForkHarness;
//!
//! # async fn run(harness: &mut ForkHarness) -> fork_harness::Result<()> {
//! let registry = harness.registry_address();
//! let handle = harness.redeploy("AaveSupply", registry, true, true).await?;
//! assert_eq!(harness.get_addr_from_registry("AaveSupply").await?, handle.address);
//! # Ok(())
//! # }
//! ```
//!
//! All ledger access goes through `&mut self`, so one harness drives one fork
//! strictly sequentially. Parallel test workers need a fork (and harness) each.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod actions;
pub mod artifacts;
pub mod assets;
pub mod config;
pub mod error;
pub mod exchange;
pub mod forge;
pub mod fork;
pub mod impersonate;
pub mod price;
pub mod proxy;
pub mod receipt;
pub mod registry;
pub mod rpc;
pub mod snapshot;
pub mod types;

// Re-export commonly used types
pub use actions::{Action, ActionExecutor, ActionOutcome, Recipe, STABLE_RATE, VARIABLE_RATE};
pub use artifacts::{Artifact, ArtifactSource, FsArtifactStore, InMemoryArtifacts};
pub use assets::{AssetBook, AssetInfo};
pub use config::{CheatcodeDialect, HarnessConfig, Network};
pub use error::{HarnessError, Result, StorageInjectionError};
pub use exchange::{ExchangeOrder, OffchainData, WrapperRegistry, MOCK_EXCHANGE_WRAPPER};
pub use forge::{BalanceForger, SlotLayout};
pub use fork::{ForkController, ForkHandle};
pub use impersonate::{ImpersonationSession, Impersonator};
pub use price::{AmountConverter, HttpPriceFeed, PriceFeed, StaticPriceTable, TokenAmount};
pub use proxy::{ProxyHandle, ProxyProvider};
pub use receipt::ReceiptWatcher;
pub use registry::{ContractHandle, RegistryResolver};
pub use rpc::NodeRpcClient;
pub use snapshot::{SnapshotManager, SnapshotToken};
pub use types::{RegistryId, TxReceipt, TxRequest, NATIVE_ASSET};

use ethers::abi::Token;
use ethers::types::{Address, U256};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Process-scoped test context driving one fork.
///
/// Owns every harness component and threads the shared registry, proxy and
/// impersonation state through them. Hand it to test setup explicitly rather
/// than keeping it in a global.
pub struct ForkHarness {
    /// Configuration
    config: Arc<HarnessConfig>,
    /// Node client
    rpc: NodeRpcClient,
    /// Receipt polling
    watcher: ReceiptWatcher,
    /// Fork pin
    fork: ForkController,
    /// Epoch the components below were last synced to
    epoch: u64,
    /// Restore points
    snapshots: SnapshotManager,
    /// Impersonation grants
    impersonator: Impersonator,
    /// Storage-level balance writes
    forger: BalanceForger,
    /// Registry lookups and deployments
    registry: RegistryResolver,
    /// Per-owner proxies
    proxies: ProxyProvider,
    /// Action dispatch
    executor: ActionExecutor,
    /// Exchange wrapper allowlist
    wrappers: WrapperRegistry,
    /// USD sizing
    converter: AmountConverter,
    /// Known assets
    assets: AssetBook,
}

impl fmt::Debug for ForkHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkHarness")
            .field("network", &self.config.network.name())
            .field("node_url", &self.config.node_url)
            .field("fork", &self.fork.current())
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl ForkHarness {
    /// Connect to the fork node described by `config`.
    ///
    /// Pins the fork to `config.fork_block` when set, otherwise adopts the
    /// node's current head, and checks the chain id against the network.
    pub async fn connect(
        config: Arc<HarnessConfig>,
        artifacts: Arc<dyn ArtifactSource>,
        prices: Arc<dyn PriceFeed>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            "Initializing fork harness for {} at {}",
            config.network.name(),
            config.node_url
        );

        let rpc = NodeRpcClient::new(&config)?;
        let watcher = ReceiptWatcher::new(rpc.clone(), &config);
        let assets = AssetBook::new(config.assets.clone());

        let mut fork = ForkController::new(rpc.clone(), &config);
        let handle = match config.fork_block {
            Some(block) => fork.reset_fork_to_block(block).await?,
            None => fork.attach().await?,
        };

        let harness = Self {
            snapshots: SnapshotManager::new(rpc.clone(), handle.epoch),
            impersonator: Impersonator::new(rpc.clone(), handle.epoch),
            forger: BalanceForger::new(rpc.clone(), &config, &assets),
            registry: RegistryResolver::new(rpc.clone(), watcher.clone(), artifacts, &config),
            proxies: ProxyProvider::new(rpc.clone(), watcher.clone(), &config),
            executor: ActionExecutor::new(rpc.clone(), watcher.clone(), &config),
            wrappers: WrapperRegistry::new(rpc.clone(), watcher.clone(), &config),
            watcher,
            converter: AmountConverter::new(prices, assets.clone()),
            epoch: handle.epoch,
            assets,
            fork,
            rpc,
            config,
        };

        if !harness.health_check().await? {
            return Err(HarnessError::ConfigError(format!(
                "node chain id {} does not match network {}",
                handle.chain_id,
                harness.config.network.name()
            )));
        }

        Ok(harness)
    }

    /// Get configuration
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Get the node client
    pub fn rpc(&self) -> &NodeRpcClient {
        &self.rpc
    }

    /// Current fork pin
    pub fn fork_handle(&self) -> Option<ForkHandle> {
        self.fork.current()
    }

    /// Whether the node replays an upstream chain
    pub fn is_fork(&self) -> bool {
        !self.config.upstream_url.is_empty()
    }

    /// Verify the node answers and reports the configured chain
    pub async fn health_check(&self) -> Result<bool> {
        let chain_id = self.rpc.chain_id().await?;
        let head = self.rpc.block_number().await?;

        let healthy = match self.config.network.chain_id() {
            Some(expected) => expected == chain_id,
            None => true,
        };
        if healthy {
            info!("Node healthy: chain {} at block {}", chain_id, head);
        } else {
            warn!(
                "Node reports chain {} but {} was configured",
                chain_id,
                self.config.network.name()
            );
        }
        Ok(healthy)
    }

    fn sync_epoch(&mut self) {
        let epoch = self.fork.epoch();
        if epoch != self.epoch {
            self.snapshots.begin_epoch(epoch);
            self.impersonator.begin_epoch(epoch);
            self.proxies.clear();
            self.epoch = epoch;
        }
    }

    /// Re-pin the fork to `block`.
    ///
    /// Every snapshot token and impersonation session issued before this call
    /// becomes stale, and cached proxies are forgotten. Failure is fatal.
    pub async fn reset_fork_to_block(&mut self, block: u64) -> Result<ForkHandle> {
        let result = self.fork.reset_fork_to_block(block).await;
        self.sync_epoch();
        result
    }

    /// Capture the whole ledger state
    pub async fn take_snapshot(&mut self) -> Result<SnapshotToken> {
        self.snapshots.take().await
    }

    /// Rewind to `token`, consuming it.
    ///
    /// Proxies built after the snapshot no longer exist, so the proxy cache is
    /// dropped and rebuilt lazily.
    pub async fn revert_to_snapshot(&mut self, token: SnapshotToken) -> Result<()> {
        self.snapshots.revert(token).await?;
        self.proxies.clear();
        Ok(())
    }

    /// Start (or reuse) impersonation of `address`
    pub async fn impersonate(&mut self, address: Address) -> Result<ImpersonationSession> {
        self.impersonator.impersonate(address).await
    }

    /// Fail unless `session` survives in the current fork epoch
    pub fn ensure_session(&self, session: &ImpersonationSession) -> Result<()> {
        self.impersonator.ensure_active(session)
    }

    /// End an impersonation session
    pub async fn stop_impersonating(&mut self, session: ImpersonationSession) -> Result<()> {
        self.impersonator.release(session).await
    }

    /// Known asset by symbol
    pub fn asset(&self, symbol: &str) -> Result<&AssetInfo> {
        self.assets.get(symbol)
    }

    /// Forge `holder`'s balance of `token` to exactly `amount`.
    ///
    /// Writes storage directly; no transfer takes place. [`NATIVE_ASSET`]
    /// sets the account's native balance.
    pub async fn set_balance(&mut self, token: Address, holder: Address, amount: U256) -> Result<()> {
        self.forger.set_balance(token, holder, amount).await
    }

    /// Give `account` the configured native top-up
    pub async fn top_up(&self, account: Address) -> Result<()> {
        self.forger
            .set_native_balance(account, self.config.top_up_wei)
            .await
    }

    /// `holder`'s balance of `token` (or of the native asset)
    pub async fn balance_of(&self, token: Address, holder: Address) -> Result<U256> {
        self.forger.balance_of(token, holder).await
    }

    /// Impersonate `account` and fund it for gas if it has nothing
    async fn prepare_sender(&mut self, account: Address) -> Result<()> {
        self.impersonator.impersonate(account).await?;
        if self.rpc.get_balance(account).await?.is_zero() {
            self.top_up(account).await?;
        }
        Ok(())
    }

    /// Let `spender` move all of `owner`'s `token`, sent as `owner`
    pub async fn approve(&mut self, token: Address, spender: Address, owner: Address) -> Result<()> {
        self.prepare_sender(owner).await?;

        let data = registry::calldata(
            "approve(address,uint256)",
            &[Token::Address(spender), Token::Uint(U256::MAX)],
        );
        let tx = TxRequest::call(owner, token, data).with_gas(self.config.gas_limit);
        let hash = self
            .rpc
            .send_transaction(&tx)
            .await
            .map_err(|e| match actions::revert_reason(&e) {
                Some(reason) => HarnessError::ActionReverted {
                    action: "approve".to_string(),
                    reason,
                },
                None => e,
            })?;

        let receipt = self.watcher.wait(hash).await?;
        if !receipt.succeeded() {
            return Err(HarnessError::ActionReverted {
                action: "approve".to_string(),
                reason: format!("approve of {:?} on {:?} reverted", spender, token),
            });
        }
        Ok(())
    }

    /// Read `function` on `contract` and decode the result
    pub async fn call_contract(
        &self,
        contract: &ContractHandle,
        function: &str,
        args: &[Token],
    ) -> Result<Vec<Token>> {
        contract
            .call(&self.rpc, self.registry.deployer(), function, args)
            .await
    }

    /// Send `function` on `contract` as `from`, impersonating it as needed
    pub async fn send_contract(
        &mut self,
        contract: &ContractHandle,
        from: Address,
        function: &str,
        args: &[Token],
    ) -> Result<TxReceipt> {
        self.prepare_sender(from).await?;
        contract
            .send(
                &self.rpc,
                &self.watcher,
                from,
                function,
                args,
                self.config.gas_limit,
            )
            .await
    }

    /// Configured registry contract
    pub fn registry_address(&self) -> Address {
        self.registry.registry_address()
    }

    /// Deploy `name` afresh and optionally register it in `registry`
    pub async fn redeploy(
        &mut self,
        name: &str,
        registry: Address,
        should_register: bool,
        is_fork: bool,
    ) -> Result<ContractHandle> {
        self.registry
            .redeploy(&mut self.impersonator, name, registry, should_register, is_fork)
            .await
    }

    /// [`redeploy`](Self::redeploy) with constructor arguments
    pub async fn redeploy_with_args(
        &mut self,
        name: &str,
        registry: Address,
        should_register: bool,
        is_fork: bool,
        args: &[Token],
    ) -> Result<ContractHandle> {
        self.registry
            .redeploy_with_args(
                &mut self.impersonator,
                name,
                registry,
                should_register,
                is_fork,
                args,
            )
            .await
    }

    /// Address registered under `name`
    pub async fn get_addr_from_registry(&self, name: &str) -> Result<Address> {
        self.registry.get_addr_from_registry(name).await
    }

    /// `owner`'s proxy, built on first use
    pub async fn get_proxy(&mut self, owner: Address) -> Result<ProxyHandle> {
        self.proxies.get_proxy(&mut self.impersonator, owner).await
    }

    /// Execute `action` through `owner`'s proxy
    pub async fn execute_action(&mut self, owner: Address, action: &Action) -> Result<ActionOutcome> {
        let proxy = self.get_proxy(owner).await?;
        self.executor
            .execute(&self.registry, &mut self.impersonator, proxy, action)
            .await
    }

    /// Execute `recipe` atomically through `owner`'s proxy
    pub async fn execute_recipe(&mut self, owner: Address, recipe: &Recipe) -> Result<ActionOutcome> {
        let proxy = self.get_proxy(owner).await?;
        self.executor
            .execute_recipe(&self.registry, &mut self.impersonator, proxy, recipe)
            .await
    }

    /// Amount of `symbol` worth `usd_amount` dollars
    pub async fn fetch_amount_in_usd_price(
        &self,
        symbol: &str,
        usd_amount: &str,
    ) -> Result<TokenAmount> {
        self.converter
            .fetch_amount_in_usd_price(symbol, usd_amount)
            .await
    }

    /// Allow trades through `wrapper`
    pub async fn set_new_exchange_wrapper(&mut self, wrapper: Address) -> Result<()> {
        let is_fork = self.is_fork();
        self.wrappers
            .add_wrapper(&mut self.impersonator, wrapper, is_fork)
            .await
    }

    /// Whether trades through `wrapper` are allowed
    pub async fn is_exchange_wrapper(&self, wrapper: Address) -> Result<bool> {
        self.wrappers.is_wrapper(wrapper).await
    }

    /// Sell order of `src_amount` `src` for `dest` through the registered mock wrapper.
    ///
    /// The rate follows the USD prices of both assets, and the wrapper's
    /// `dest` balance is forged to exactly what the order pays out.
    pub async fn format_mock_exchange_order(
        &mut self,
        src: &str,
        dest: &str,
        src_amount: U256,
    ) -> Result<ExchangeOrder> {
        let src_asset = self.assets.get(src)?.clone();
        let dest_asset = self.assets.get(dest)?.clone();
        let wrapper = self.get_addr_from_registry(MOCK_EXCHANGE_WRAPPER).await?;

        let rate = self.converter.exchange_rate(src, dest).await?;
        let order = ExchangeOrder::mock(src_asset.address, dest_asset.address, src_amount, wrapper, rate);

        let payout = order.expected_output()?;
        self.set_balance(dest_asset.address, wrapper, payout).await?;
        info!(
            "Mock order {} {} -> {} {} via {:?}",
            src_amount, src, payout, dest, wrapper
        );
        Ok(order)
    }

    /// Advance the fork clock by `seconds` and mine a block
    pub async fn time_travel(&self, seconds: u64) -> Result<()> {
        self.rpc.increase_time(seconds).await?;
        self.rpc.mine().await?;
        info!("Advanced fork time by {} seconds", seconds);
        Ok(())
    }
}
