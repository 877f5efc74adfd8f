//! JSON-RPC client for the fork node.
//!
//! Built on an ethers [`Provider`] over HTTP. Standard reads go through the
//! typed [`Middleware`] calls; the node's cheat methods (`evm_snapshot`,
//! `<dialect>_reset`, `<dialect>_setStorageAt`, ...) and unlocked sends go
//! through [`Provider::request`]. Calls are awaited one at a time and nothing
//! is retried.

use crate::config::{CheatcodeDialect, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::types::TxRequest;
use ethers::providers::{Http, Middleware, PendingTransaction, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// Fork node JSON-RPC client
#[derive(Clone, Debug)]
pub struct NodeRpcClient {
    /// ethers provider pointed at the node
    provider: Provider<Http>,
    /// Cheat method namespace
    dialect: CheatcodeDialect,
}

impl NodeRpcClient {
    /// Create a new node client
    pub fn new(config: &HarnessConfig) -> Result<Self> {
        let url = Url::parse(&config.node_url)?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(HarnessError::NetworkError)?;

        let provider = Provider::new(Http::new_with_client(url, client))
            .interval(Duration::from_millis(config.receipt_poll_interval_ms));

        Ok(Self {
            provider,
            dialect: config.dialect,
        })
    }

    /// Cheat method namespace in use
    pub fn dialect(&self) -> CheatcodeDialect {
        self.dialect
    }

    /// Underlying ethers provider
    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }

    /// Issue a raw JSON-RPC request and decode the result
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Debug + Serialize + Send + Sync,
        R: Serialize + DeserializeOwned + Debug + Send,
    {
        debug!("Node RPC request: {}", method);
        self.provider
            .request(method, params)
            .await
            .map_err(|e| logged(method, e.into()))
    }

    /// Call a cheat method that acknowledges with `true`
    async fn call_cheat<P>(&self, method: &str, params: P) -> Result<()>
    where
        P: Debug + Serialize + Send + Sync,
    {
        let acknowledged: Value = self.request(method, params).await?;
        match acknowledged {
            Value::Bool(false) => Err(HarnessError::InvalidResponse(format!(
                "{} returned false",
                method
            ))),
            _ => Ok(()),
        }
    }

    /// Chain id reported by the node
    pub async fn chain_id(&self) -> Result<u64> {
        let id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| logged("eth_chainId", e.into()))?;
        Ok(id.low_u64())
    }

    /// Current head of the fork
    pub async fn block_number(&self) -> Result<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| logged("eth_blockNumber", e.into()))?;
        Ok(number.as_u64())
    }

    /// Native balance of an account
    pub async fn get_balance(&self, account: Address) -> Result<U256> {
        self.provider
            .get_balance(account, None)
            .await
            .map_err(|e| logged("eth_getBalance", e.into()))
    }

    /// Deployed bytecode at an address
    pub async fn get_code(&self, account: Address) -> Result<Bytes> {
        self.provider
            .get_code(account, None)
            .await
            .map_err(|e| logged("eth_getCode", e.into()))
    }

    /// Raw 32-byte storage word
    pub async fn get_storage_at(&self, account: Address, slot: H256) -> Result<H256> {
        self.provider
            .get_storage_at(account, slot, None)
            .await
            .map_err(|e| logged("eth_getStorageAt", e.into()))
    }

    /// Execute a read-only call against the fork head
    pub async fn eth_call(&self, tx: &TxRequest) -> Result<Bytes> {
        let typed: TypedTransaction = tx.into();
        self.provider
            .call(&typed, None)
            .await
            .map_err(|e| logged("eth_call", e.into()))
    }

    /// Send a transaction from an unlocked or impersonated account.
    ///
    /// The request goes out exactly as built; the node fills nonce and gas.
    pub async fn send_transaction(&self, tx: &TxRequest) -> Result<H256> {
        let hash: H256 = self.request("eth_sendTransaction", [tx]).await?;
        debug!("Transaction sent: {:?}", hash);
        Ok(hash)
    }

    /// Pending handle for a sent transaction, polled at the provider interval
    pub fn pending_transaction(&self, hash: H256) -> PendingTransaction<'_, Http> {
        PendingTransaction::new(hash, &self.provider)
    }

    /// Re-fork from `upstream_url` at `block`
    pub async fn reset(&self, upstream_url: &str, block: u64) -> Result<()> {
        let params = json!([{
            "forking": {
                "jsonRpcUrl": upstream_url,
                "blockNumber": block
            }
        }]);
        self.call_cheat(&self.dialect.method("reset"), params).await
    }

    /// Capture a restore point; returns the node's snapshot id
    pub async fn snapshot(&self) -> Result<String> {
        let id: Value = self.request("evm_snapshot", ()).await?;
        match id {
            Value::String(s) => Ok(s),
            Value::Number(n) => n
                .as_u64()
                .map(|n| format!("{:#x}", n))
                .ok_or_else(|| HarnessError::InvalidResponse(format!("Unexpected snapshot id: {}", n))),
            other => Err(HarnessError::InvalidResponse(format!(
                "Unexpected snapshot id: {}",
                other
            ))),
        }
    }

    /// Rewind to a snapshot; `false` means the node did not know the id
    pub async fn revert(&self, snapshot_id: &str) -> Result<bool> {
        self.request("evm_revert", [snapshot_id]).await
    }

    /// Allow sending transactions as `account` without its key
    pub async fn impersonate_account(&self, account: Address) -> Result<()> {
        self.call_cheat(&self.dialect.method("impersonateAccount"), [account])
            .await
    }

    /// Revoke impersonation of `account`
    pub async fn stop_impersonating_account(&self, account: Address) -> Result<()> {
        self.call_cheat(&self.dialect.method("stopImpersonatingAccount"), [account])
            .await
    }

    /// Overwrite a storage word
    pub async fn set_storage_at(&self, account: Address, slot: H256, value: H256) -> Result<()> {
        self.call_cheat(
            &self.dialect.method("setStorageAt"),
            json!([account, slot_quantity(slot), value]),
        )
        .await
    }

    /// Overwrite a native balance
    pub async fn set_balance(&self, account: Address, amount: U256) -> Result<()> {
        self.call_cheat(&self.dialect.method("setBalance"), json!([account, amount]))
            .await
    }

    /// Advance the clock by `seconds`
    pub async fn increase_time(&self, seconds: u64) -> Result<()> {
        let _: Value = self.request("evm_increaseTime", [seconds]).await?;
        Ok(())
    }

    /// Mine one block
    pub async fn mine(&self) -> Result<()> {
        let _: Value = self.request("evm_mine", ()).await?;
        Ok(())
    }
}

fn logged(method: &str, err: HarnessError) -> HarnessError {
    if let HarnessError::Rpc { code, message, .. } = &err {
        error!("Node RPC error on {}: {} (code: {})", method, message, code);
    }
    err
}

/// Storage keys travel as quantities (no leading zeros)
fn slot_quantity(slot: H256) -> String {
    format!("{:#x}", U256::from_big_endian(slot.as_bytes()))
}
