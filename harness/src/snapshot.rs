//! Ledger snapshots.
//!
//! `take` captures the node's state and hands back a [`SnapshotToken`];
//! `revert` consumes it. Tokens are deliberately not `Clone`, so a token can be
//! redeemed at most once. Nested snapshots behave like a stack: reverting an
//! outer token also invalidates every token taken after it.

use crate::error::{HarnessError, Result};
use crate::rpc::NodeRpcClient;
use std::fmt;
use tracing::{debug, warn};

/// Restore point handed out by [`SnapshotManager::take`]
#[derive(Debug, PartialEq, Eq)]
pub struct SnapshotToken {
    /// Node-issued snapshot id
    id: String,
    /// Fork epoch the snapshot belongs to
    epoch: u64,
    /// Position in the take order
    seq: u64,
}

impl SnapshotToken {
    /// Node-issued snapshot id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fork epoch the snapshot was taken in
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.epoch)
    }
}

/// Issues and redeems snapshot tokens
pub struct SnapshotManager {
    rpc: NodeRpcClient,
    epoch: u64,
    next_seq: u64,
    /// Outstanding (seq, id) pairs in take order
    live: Vec<(u64, String)>,
}

impl SnapshotManager {
    /// Create a manager for the given fork epoch
    pub fn new(rpc: NodeRpcClient, epoch: u64) -> Self {
        Self {
            rpc,
            epoch,
            next_seq: 0,
            live: Vec::new(),
        }
    }

    /// Drop every outstanding token; called after a fork re-pin
    pub fn begin_epoch(&mut self, epoch: u64) {
        if !self.live.is_empty() {
            debug!(
                "Discarding {} outstanding snapshots from epoch {}",
                self.live.len(),
                self.epoch
            );
        }
        self.epoch = epoch;
        self.live.clear();
    }

    /// Number of tokens that can still be redeemed
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    /// Capture the current ledger state
    pub async fn take(&mut self) -> Result<SnapshotToken> {
        let id = self.rpc.snapshot().await?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.push((seq, id.clone()));

        debug!("Took snapshot {} (depth {})", id, self.live.len());
        Ok(SnapshotToken {
            id,
            epoch: self.epoch,
            seq,
        })
    }

    /// Restore the state captured by `token`, consuming it
    pub async fn revert(&mut self, token: SnapshotToken) -> Result<()> {
        if token.epoch != self.epoch {
            warn!("Snapshot {} predates the current fork pin", token);
            return Err(HarnessError::StaleSnapshot(token.to_string()));
        }

        let position = self
            .live
            .iter()
            .position(|(seq, _)| *seq == token.seq)
            .ok_or_else(|| {
                warn!("Snapshot {} was invalidated by an outer revert", token);
                HarnessError::StaleSnapshot(token.to_string())
            })?;

        let reverted = self.rpc.revert(&token.id).await?;

        // The node drops this snapshot and every later one either way
        self.live.truncate(position);

        if !reverted {
            return Err(HarnessError::SnapshotRejected(token.to_string()));
        }

        debug!("Reverted to snapshot {} (depth {})", token, self.live.len());
        Ok(())
    }
}
