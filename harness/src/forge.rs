//! Balance forging by direct storage injection.
//!
//! This is an unsafe state-injection capability: it overwrites the storage word
//! behind `balanceOf(holder)` instead of moving tokens, so nothing about it
//! resembles a real transfer. It lives apart from the action path and reports
//! failures through [`StorageInjectionError`].
//!
//! Slot discovery uses a known layout when the asset book has one. Otherwise
//! candidate indices are probed in ascending order, Solidity layout before
//! Vyper layout at each index: a sentinel is written, `balanceOf` is read back,
//! and the original word is restored and re-verified. The first candidate that
//! round-trips wins and is cached per token for the rest of the run.
//!
//! When the balance shares its word with other fields, only the balance's
//! low-order bits are replaced. A write that cannot keep the other bits intact
//! fails with [`StorageInjectionError::PackedLayout`], and every failed write
//! restores the original word.

use crate::assets::AssetBook;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result, StorageInjectionError};
use crate::rpc::NodeRpcClient;
use crate::types::{TxRequest, NATIVE_ASSET};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{id, keccak256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Value written during probing; chosen to be recognisable and to fit in 96 bits
const PROBE_SENTINEL: u64 = 0x1337_c0ff_ee00;

/// Where a token keeps `mapping(address => uint256)` balances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SlotLayout {
    /// `keccak256(abi.encode(holder, slot))`
    Solidity {
        /// Mapping's declaration slot
        slot: u64,
    },
    /// `keccak256(abi.encode(slot, holder))`
    Vyper {
        /// Mapping's declaration slot
        slot: u64,
    },
}

impl SlotLayout {
    /// Storage key holding `holder`'s balance
    pub fn storage_key(&self, holder: Address) -> H256 {
        let encoded = match self {
            SlotLayout::Solidity { slot } => {
                abi::encode(&[Token::Address(holder), Token::Uint(U256::from(*slot))])
            }
            SlotLayout::Vyper { slot } => {
                abi::encode(&[Token::Uint(U256::from(*slot)), Token::Address(holder)])
            }
        };
        H256(keccak256(encoded))
    }

    /// Declaration slot index
    pub fn index(&self) -> u64 {
        match self {
            SlotLayout::Solidity { slot } | SlotLayout::Vyper { slot } => *slot,
        }
    }

    /// Candidates in probing order: ascending index, Solidity before Vyper
    pub fn candidates(max_slots: u64) -> impl Iterator<Item = SlotLayout> {
        (0..max_slots)
            .flat_map(|slot| [SlotLayout::Solidity { slot }, SlotLayout::Vyper { slot }])
    }
}

fn word(value: U256) -> H256 {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    H256(buf)
}

/// Low-order bits of a storage word that hold the balance.
///
/// A word equal to the current balance is owned outright. Otherwise the
/// balance shares the word with other fields, and the narrowest whole-byte
/// field that holds both the current balance and `amount` is used so the
/// upper fields survive the write. `None` when no such field exists.
fn balance_mask(original: H256, before: U256, amount: U256) -> Option<U256> {
    let value = U256::from_big_endian(original.as_bytes());
    if value == before {
        return Some(U256::MAX);
    }
    (1..32usize)
        .map(|bytes| (U256::one() << (bytes * 8)) - 1)
        .find(|mask| value & *mask == before && amount <= *mask)
}

/// Writes token balances straight into contract storage
pub struct BalanceForger {
    rpc: NodeRpcClient,
    max_probe_slots: u64,
    /// Known and discovered layouts, per token
    layouts: HashMap<Address, SlotLayout>,
}

impl BalanceForger {
    /// Create a forger seeded with the asset book's known layouts
    pub fn new(rpc: NodeRpcClient, config: &HarnessConfig, assets: &AssetBook) -> Self {
        let layouts = assets
            .iter()
            .filter_map(|asset| asset.balance_slot.map(|layout| (asset.address, layout)))
            .collect::<HashMap<_, _>>();

        debug!("Balance forger seeded with {} known layouts", layouts.len());

        Self {
            rpc,
            max_probe_slots: config.max_probe_slots,
            layouts,
        }
    }

    /// Layout in use for `token`, if known or already discovered
    pub fn layout(&self, token: Address) -> Option<SlotLayout> {
        self.layouts.get(&token).copied()
    }

    /// `balanceOf(holder)` on `token`; the native sentinel reads the account balance
    pub async fn balance_of(&self, token: Address, holder: Address) -> Result<U256> {
        if token == NATIVE_ASSET {
            return self.rpc.get_balance(holder).await;
        }

        let mut data = id("balanceOf(address)").to_vec();
        data.extend(abi::encode(&[Token::Address(holder)]));

        let output = self
            .rpc
            .eth_call(&TxRequest::call(holder, token, Bytes::from(data)))
            .await?;

        let decoded = abi::decode(&[ParamType::Uint(256)], &output)?;
        decoded
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| {
                HarnessError::InvalidResponse(format!("balanceOf on {:?} returned no value", token))
            })
    }

    /// Overwrite an account's native balance
    pub async fn set_native_balance(&self, holder: Address, amount: U256) -> Result<()> {
        self.rpc.set_balance(holder, amount).await?;
        debug!("Native balance of {:?} forged to {}", holder, amount);
        Ok(())
    }

    /// Make `balanceOf(holder)` on `token` return exactly `amount`
    pub async fn set_balance(&mut self, token: Address, holder: Address, amount: U256) -> Result<()> {
        if token == NATIVE_ASSET {
            return self.set_native_balance(holder, amount).await;
        }

        if let Some(layout) = self.layout(token) {
            match self.write_and_verify(token, holder, layout, amount).await {
                Ok(()) => return Ok(()),
                Err(HarnessError::StorageInjection(StorageInjectionError::ReadBackMismatch {
                    ..
                })) => {
                    warn!(
                        "Cached layout {:?} for {:?} did not round-trip, probing instead",
                        layout, token
                    );
                    self.layouts.remove(&token);
                }
                Err(e) => return Err(e),
            }
        }

        let layout = self.locate_slot(token, holder).await?;
        self.write_and_verify(token, holder, layout, amount).await
    }

    async fn write_and_verify(
        &self,
        token: Address,
        holder: Address,
        layout: SlotLayout,
        amount: U256,
    ) -> Result<()> {
        let key = layout.storage_key(holder);
        let original = self.rpc.get_storage_at(token, key).await?;
        let before = self.balance_of(token, holder).await?;

        let mask = balance_mask(original, before, amount).ok_or_else(|| {
            StorageInjectionError::PackedLayout {
                token,
                holder,
                slot: format!("{:?}", key),
            }
        })?;
        let value = U256::from_big_endian(original.as_bytes());
        self.rpc
            .set_storage_at(token, key, word((value & !mask) | amount))
            .await?;

        if let Err(e) = self.verify_write(token, holder, key, original, mask, amount).await {
            self.rpc.set_storage_at(token, key, original).await?;
            return Err(e);
        }

        debug!(
            "Forged balance of {:?} on {:?} to {} via {:?}",
            holder, token, amount, layout
        );
        Ok(())
    }

    /// `balanceOf` reports `amount` and bits outside `mask` still hold their original value
    async fn verify_write(
        &self,
        token: Address,
        holder: Address,
        key: H256,
        original: H256,
        mask: U256,
        amount: U256,
    ) -> Result<()> {
        let observed = self.balance_of(token, holder).await?;
        if observed != amount {
            return Err(StorageInjectionError::ReadBackMismatch {
                token,
                holder,
                expected: amount.to_string(),
                actual: observed.to_string(),
            }
            .into());
        }

        let written = U256::from_big_endian(self.rpc.get_storage_at(token, key).await?.as_bytes());
        let value = U256::from_big_endian(original.as_bytes());
        if written & !mask != value & !mask {
            return Err(StorageInjectionError::PackedLayout {
                token,
                holder,
                slot: format!("{:?}", key),
            }
            .into());
        }
        Ok(())
    }

    /// Probe candidate slots until one round-trips the sentinel
    async fn locate_slot(&mut self, token: Address, holder: Address) -> Result<SlotLayout> {
        let before = self.balance_of(token, holder).await?;

        for layout in SlotLayout::candidates(self.max_probe_slots) {
            if self.probe(token, holder, layout, before).await? {
                info!("Balance mapping of {:?} found at {:?}", token, layout);
                self.layouts.insert(token, layout);
                return Ok(layout);
            }
        }

        warn!(
            "No balance slot found for {:?} in {} indices",
            token, self.max_probe_slots
        );
        Err(StorageInjectionError::UnsupportedTokenLayout {
            token,
            probed: self.max_probe_slots,
        }
        .into())
    }

    /// Trial-write the sentinel at one candidate, always restoring the word
    async fn probe(
        &self,
        token: Address,
        holder: Address,
        layout: SlotLayout,
        before: U256,
    ) -> Result<bool> {
        let key = layout.storage_key(holder);
        let original = self.rpc.get_storage_at(token, key).await?;
        let sentinel = U256::from(PROBE_SENTINEL);

        self.rpc.set_storage_at(token, key, word(sentinel)).await?;
        let observed = self.balance_of(token, holder).await;
        self.rpc.set_storage_at(token, key, original).await?;

        let restored = self.rpc.get_storage_at(token, key).await?;
        let after = self.balance_of(token, holder).await?;
        if restored != original || after != before {
            return Err(StorageInjectionError::RestoreFailed {
                token,
                slot: format!("{:?}", key),
            }
            .into());
        }

        let hit = observed? == sentinel;
        debug!("Probe {:?} on {:?}: {}", layout, token, if hit { "hit" } else { "miss" });
        Ok(hit)
    }
}
