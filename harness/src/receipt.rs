//! Waiting for transaction receipts.
//!
//! Fork nodes usually automine, so a receipt is normally available on the
//! first poll. When interval mining is enabled the watcher keeps polling at
//! the configured interval until the timeout, which is a fatal error.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::rpc::NodeRpcClient;
use crate::types::TxReceipt;
use ethers::types::H256;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Polls the node until a transaction is mined
#[derive(Clone)]
pub struct ReceiptWatcher {
    /// Node client
    rpc: NodeRpcClient,
    /// Poll interval
    poll_interval: Duration,
    /// Total wait budget
    timeout: Duration,
}

impl ReceiptWatcher {
    /// Create a watcher from harness config
    pub fn new(rpc: NodeRpcClient, config: &HarnessConfig) -> Self {
        Self {
            rpc,
            poll_interval: Duration::from_millis(config.receipt_poll_interval_ms),
            timeout: Duration::from_secs(config.receipt_timeout_secs),
        }
    }

    /// Wait for the receipt of `hash`
    pub async fn wait(&self, hash: H256) -> Result<TxReceipt> {
        let pending = self
            .rpc
            .pending_transaction(hash)
            .interval(self.poll_interval);

        match timeout(self.timeout, pending).await {
            Ok(Ok(Some(receipt))) => {
                debug!(
                    "Transaction {:?} mined (status: {:?})",
                    hash, receipt.status
                );
                Ok(receipt.into())
            }
            Ok(Ok(None)) => {
                warn!("Transaction {:?} dropped", hash);
                Err(HarnessError::TransactionDropped(format!("{:?}", hash)))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("Timed out waiting for transaction {:?}", hash);
                Err(HarnessError::TransactionTimeout {
                    hash: format!("{:?}", hash),
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }
}
