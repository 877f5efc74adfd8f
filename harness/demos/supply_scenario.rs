//! Example: Aave supply through a proxy on a pinned mainnet fork
//!
//! Start a fork node first, e.g. `npx hardhat node` or `anvil`, then run
//!
//! ```text
//! FORK_UPSTREAM_URL=https://<archive-node> cargo run --example supply_scenario -- harness.toml
//! ```
//!
//! The config file supplies the registry, proxy factory, deployer, assets and
//! prices. Set `AAVE_MARKET` and optionally `SUPPLY_USER`.

use anyhow::{Context, Result};
use ethers::types::Address;
use fork_harness::{Action, ForkHarness, FsArtifactStore, HarnessConfig, StaticPriceTable};
use std::sync::Arc;
use tracing::info;

const DEFAULT_USER: &str = "0x00000000000000000000000000000000000a11ce";

#[tokio::main]
async fn main() -> Result<()> {
    fork_harness::init_tracing();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "harness.toml".to_string());
    let config = HarnessConfig::from_file(&path)?.with_env_overrides()?;

    let market: Address = std::env::var("AAVE_MARKET")
        .context("AAVE_MARKET must be set")?
        .parse()
        .context("AAVE_MARKET is not an address")?;
    let user: Address = std::env::var("SUPPLY_USER")
        .unwrap_or_else(|_| DEFAULT_USER.to_string())
        .parse()
        .context("SUPPLY_USER is not an address")?;

    let artifacts_dir = config
        .artifacts_dir
        .clone()
        .unwrap_or_else(|| "artifacts".into());
    let prices = StaticPriceTable::new(config.prices.clone());

    let mut harness = ForkHarness::connect(
        Arc::new(config),
        Arc::new(FsArtifactStore::new(artifacts_dir)),
        Arc::new(prices),
    )
    .await?;

    let snapshot = harness.take_snapshot().await?;

    let registry = harness.registry_address();
    let action = harness.redeploy("AaveSupply", registry, true, true).await?;
    info!("AaveSupply redeployed at {:?}", action.address);

    let weth = harness.asset("WETH")?.clone();
    let amount = harness.fetch_amount_in_usd_price("WETH", "10000").await?;
    info!("Supplying {} WETH", amount.to_decimal_string()?);

    harness.set_balance(weth.address, user, amount.base_units).await?;
    let proxy = harness.get_proxy(user).await?;
    harness.approve(weth.address, proxy.address, user).await?;

    let outcome = harness
        .execute_action(
            user,
            &Action::AaveSupply {
                market,
                asset: weth.address,
                amount: amount.base_units,
                from: user,
                on_behalf_of: Address::zero(),
                enable_as_coll: true,
            },
        )
        .await?;
    info!("Supply mined in {:?}", outcome.tx_hash);

    let remaining = harness.balance_of(weth.address, user).await?;
    info!("WETH left with {:?}: {}", user, remaining);

    harness.revert_to_snapshot(snapshot).await?;
    info!("Fork restored");
    Ok(())
}
