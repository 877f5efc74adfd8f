//! Per-owner proxies.
//!
//! Each owner gets exactly one proxy from the proxy factory. Proxies are
//! looked up (or built) lazily and cached for the rest of the fork epoch.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::impersonate::Impersonator;
use crate::receipt::ReceiptWatcher;
use crate::registry::{calldata, decode_address};
use crate::rpc::NodeRpcClient;
use crate::types::TxRequest;
use ethers::abi::Token;
use ethers::types::{Address, U256};
use std::collections::HashMap;
use tracing::{debug, info};

/// An owner's proxy contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHandle {
    /// Account the proxy acts for
    pub owner: Address,
    /// Proxy contract
    pub address: Address,
}

/// Finds or builds proxies through the proxy factory
pub struct ProxyProvider {
    rpc: NodeRpcClient,
    watcher: ReceiptWatcher,
    factory: Address,
    gas_limit: u64,
    top_up_wei: U256,
    cache: HashMap<Address, ProxyHandle>,
}

impl ProxyProvider {
    /// Create a provider for the configured factory
    pub fn new(rpc: NodeRpcClient, watcher: ReceiptWatcher, config: &HarnessConfig) -> Self {
        Self {
            rpc,
            watcher,
            factory: config.proxy_registry,
            gas_limit: config.gas_limit,
            top_up_wei: config.top_up_wei,
            cache: HashMap::new(),
        }
    }

    /// Forget cached proxies; called after a fork re-pin
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Cached proxy for `owner`, if any
    pub fn cached(&self, owner: Address) -> Option<ProxyHandle> {
        self.cache.get(&owner).copied()
    }

    /// The owner's proxy, built on first use
    pub async fn get_proxy(
        &mut self,
        impersonator: &mut Impersonator,
        owner: Address,
    ) -> Result<ProxyHandle> {
        if let Some(handle) = self.cached(owner) {
            return Ok(handle);
        }

        let address = match self.lookup(owner).await? {
            Some(address) => address,
            None => {
                self.build(impersonator, owner).await?;
                self.lookup(owner).await?.ok_or_else(|| {
                    HarnessError::InvalidResponse(format!(
                        "proxy factory built nothing for {:?}",
                        owner
                    ))
                })?
            }
        };

        let handle = ProxyHandle { owner, address };
        self.cache.insert(owner, handle);
        debug!("Proxy for {:?} is {:?}", owner, address);
        Ok(handle)
    }

    async fn lookup(&self, owner: Address) -> Result<Option<Address>> {
        let data = calldata("proxies(address)", &[Token::Address(owner)]);
        let output = self
            .rpc
            .eth_call(&TxRequest::call(owner, self.factory, data))
            .await?;
        let address = decode_address(&output)?;
        Ok((!address.is_zero()).then_some(address))
    }

    async fn build(&self, impersonator: &mut Impersonator, owner: Address) -> Result<()> {
        impersonator.impersonate(owner).await?;
        if self.rpc.get_balance(owner).await?.is_zero() {
            self.rpc.set_balance(owner, self.top_up_wei).await?;
        }

        let data = calldata("build(address)", &[Token::Address(owner)]);
        let tx = TxRequest::call(owner, self.factory, data).with_gas(self.gas_limit);
        let hash = self.rpc.send_transaction(&tx).await?;
        let receipt = self.watcher.wait(hash).await?;
        if !receipt.succeeded() {
            return Err(HarnessError::DeploymentFailed {
                name: "proxy".to_string(),
                reason: format!("build for {:?} reverted", owner),
            });
        }

        info!("Built proxy for {:?}", owner);
        Ok(())
    }
}
