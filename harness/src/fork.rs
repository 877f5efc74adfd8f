//! Ledger fork controller.
//!
//! Pins the fork node to a historical block. Every pin starts a new epoch;
//! snapshot tokens and impersonation sessions carry the epoch they were issued
//! in and are rejected once a later pin has discarded their state line.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::rpc::NodeRpcClient;
use tracing::{error, info};

/// Identifies the fork and the height it is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkHandle {
    /// Block the fork replays from
    pub block_number: u64,
    /// Pin generation; bumped by every reset
    pub epoch: u64,
    /// Chain id reported by the node
    pub chain_id: u64,
}

/// Pins and re-pins the fork
pub struct ForkController {
    /// Node client
    rpc: NodeRpcClient,
    /// Archive endpoint the fork replays from
    upstream_url: String,
    /// Current pin
    current: Option<ForkHandle>,
    /// Epochs issued so far
    epoch: u64,
}

impl ForkController {
    /// Create a controller; no pin is recorded until [`attach`](Self::attach) or a reset
    pub fn new(rpc: NodeRpcClient, config: &HarnessConfig) -> Self {
        Self {
            rpc,
            upstream_url: config.upstream_url.clone(),
            current: None,
            epoch: 0,
        }
    }

    /// Current pin, if any
    pub fn current(&self) -> Option<ForkHandle> {
        self.current
    }

    /// Current epoch (0 before the first pin)
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Adopt whatever block the node was started on as the first epoch
    pub async fn attach(&mut self) -> Result<ForkHandle> {
        let block_number = self.rpc.block_number().await?;
        let chain_id = self.rpc.chain_id().await?;

        self.epoch += 1;
        let handle = ForkHandle {
            block_number,
            epoch: self.epoch,
            chain_id,
        };
        self.current = Some(handle);

        info!(
            "Attached to fork at block {} (chain {}, epoch {})",
            block_number, chain_id, self.epoch
        );
        Ok(handle)
    }

    /// Replay state as of `block` from the upstream source.
    ///
    /// Invalidates every snapshot and impersonation session issued before the
    /// call. Failure is fatal and is not retried.
    pub async fn reset_fork_to_block(&mut self, block: u64) -> Result<ForkHandle> {
        if self.upstream_url.is_empty() {
            return Err(HarnessError::ForkPinFailed {
                block,
                reason: "no upstream URL configured".to_string(),
            });
        }

        info!("Pinning fork to block {}", block);

        self.rpc
            .reset(&self.upstream_url, block)
            .await
            .map_err(|e| {
                error!("Fork reset to block {} failed: {}", block, e);
                HarnessError::ForkPinFailed {
                    block,
                    reason: e.to_string(),
                }
            })?;

        // The previous state line is gone whatever happens next
        self.epoch += 1;
        self.current = None;

        let head = self.rpc.block_number().await?;
        if head != block {
            return Err(HarnessError::ForkPinFailed {
                block,
                reason: format!("node reports head {} after reset", head),
            });
        }
        let chain_id = self.rpc.chain_id().await?;

        let handle = ForkHandle {
            block_number: block,
            epoch: self.epoch,
            chain_id,
        };
        self.current = Some(handle);

        info!("Fork pinned to block {} (epoch {})", block, self.epoch);
        Ok(handle)
    }
}
