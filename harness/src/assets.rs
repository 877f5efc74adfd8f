//! Asset metadata: symbol to address, decimals and (optionally) the storage
//! slot that holds the token's balance mapping.

use crate::error::{HarnessError, Result};
use crate::forge::SlotLayout;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static facts about a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    /// Ticker symbol
    pub symbol: String,
    /// Token contract
    pub address: Address,
    /// Decimal precision of the base unit
    pub decimals: u8,
    /// Known balance mapping layout, skips slot probing when present
    #[serde(default)]
    pub balance_slot: Option<SlotLayout>,
}

impl AssetInfo {
    /// Describe a token
    pub fn new(symbol: impl Into<String>, address: Address, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            address,
            decimals,
            balance_slot: None,
        }
    }

    /// Record the balance mapping layout
    pub fn with_balance_slot(mut self, layout: SlotLayout) -> Self {
        self.balance_slot = Some(layout);
        self
    }

    /// Sanity-check the entry
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(HarnessError::ConfigError(
                "Asset symbol cannot be empty".to_string(),
            ));
        }
        if self.decimals > 36 {
            return Err(HarnessError::ConfigError(format!(
                "Asset {} has unsupported precision {}",
                self.symbol, self.decimals
            )));
        }
        Ok(())
    }
}

/// Lookup table of known assets
#[derive(Debug, Clone, Default)]
pub struct AssetBook {
    by_symbol: HashMap<String, AssetInfo>,
}

impl AssetBook {
    /// Build a book from a list of assets; later entries win on duplicate symbols
    pub fn new(assets: impl IntoIterator<Item = AssetInfo>) -> Self {
        let by_symbol = assets
            .into_iter()
            .map(|asset| (asset.symbol.clone(), asset))
            .collect();
        Self { by_symbol }
    }

    /// Add or replace an asset
    pub fn insert(&mut self, asset: AssetInfo) {
        self.by_symbol.insert(asset.symbol.clone(), asset);
    }

    /// Asset by symbol; `ETH` resolves to `WETH` when no `ETH` entry exists
    pub fn get(&self, symbol: &str) -> Result<&AssetInfo> {
        self.by_symbol
            .get(symbol)
            .or_else(|| match symbol {
                "ETH" => self.by_symbol.get("WETH"),
                _ => None,
            })
            .ok_or_else(|| HarnessError::UnknownAsset(symbol.to_string()))
    }

    /// Asset by contract address
    pub fn by_address(&self, address: Address) -> Option<&AssetInfo> {
        self.by_symbol.values().find(|a| a.address == address)
    }

    /// Every known asset, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &AssetInfo> {
        self.by_symbol.values()
    }

    /// Number of known assets
    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    /// Whether the book is empty
    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}
