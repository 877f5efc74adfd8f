//! Account impersonation.
//!
//! Lets the harness send transactions as any address on the fork without the
//! account's key. Impersonating an address twice is a no-op; sessions issued
//! before a fork re-pin are stale and must be re-acquired.

use crate::error::{HarnessError, Result};
use crate::rpc::NodeRpcClient;
use ethers::types::Address;
use std::collections::HashSet;
use tracing::{debug, info};

/// Grant to author transactions as `address` within one fork epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImpersonationSession {
    /// Impersonated account
    pub address: Address,
    /// Fork epoch the grant belongs to
    pub epoch: u64,
}

/// Tracks which accounts the node currently lets us impersonate
pub struct Impersonator {
    rpc: NodeRpcClient,
    epoch: u64,
    active: HashSet<Address>,
}

impl Impersonator {
    /// Create an impersonator for the given fork epoch
    pub fn new(rpc: NodeRpcClient, epoch: u64) -> Self {
        Self {
            rpc,
            epoch,
            active: HashSet::new(),
        }
    }

    /// Forget every grant; called after a fork re-pin
    pub fn begin_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.active.clear();
    }

    /// Start (or reuse) an impersonation session for `address`
    pub async fn impersonate(&mut self, address: Address) -> Result<ImpersonationSession> {
        if !self.active.contains(&address) {
            self.rpc.impersonate_account(address).await?;
            self.active.insert(address);
            info!("Impersonating {:?}", address);
        } else {
            debug!("Already impersonating {:?}", address);
        }

        Ok(ImpersonationSession {
            address,
            epoch: self.epoch,
        })
    }

    /// Whether `session` is still honoured by the node
    pub fn is_active(&self, session: &ImpersonationSession) -> bool {
        session.epoch == self.epoch && self.active.contains(&session.address)
    }

    /// Fail with `StaleSession` unless `session` is still honoured
    pub fn ensure_active(&self, session: &ImpersonationSession) -> Result<()> {
        if self.is_active(session) {
            Ok(())
        } else {
            Err(HarnessError::StaleSession(session.address))
        }
    }

    /// End a session
    pub async fn release(&mut self, session: ImpersonationSession) -> Result<()> {
        if !self.is_active(&session) {
            return Ok(());
        }
        self.rpc.stop_impersonating_account(session.address).await?;
        self.active.remove(&session.address);
        debug!("Stopped impersonating {:?}", session.address);
        Ok(())
    }
}
