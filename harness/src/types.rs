//! Common types shared across the harness: wire shapes for transactions and
//! receipts, registry ids and the native-asset sentinel.

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, H256, U256, U64};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel address standing in for the chain's native asset
pub const NATIVE_ASSET: Address = Address::repeat_byte(0xee);

/// Four-byte registry id derived from a logical contract name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryId(pub [u8; 4]);

impl RegistryId {
    /// `bytes4(keccak256(name))`
    pub fn from_name(name: &str) -> Self {
        let hash = keccak256(name.as_bytes());
        Self([hash[0], hash[1], hash[2], hash[3]])
    }
}

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Transaction sent with `eth_sendTransaction` or dry-run with `eth_call`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    /// Sender (must be unlocked or impersonated)
    pub from: Address,
    /// Recipient; `None` deploys `data` as init code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    /// Calldata or init code
    pub data: Bytes,
    /// Native value attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    /// Gas limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U256>,
}

impl TxRequest {
    /// Call `to` with `data` from `from`
    pub fn call(from: Address, to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            from,
            to: Some(to),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Deploy `init_code` from `from`
    pub fn deploy(from: Address, init_code: impl Into<Bytes>) -> Self {
        Self {
            from,
            to: None,
            data: init_code.into(),
            ..Default::default()
        }
    }

    /// Attach native value
    pub fn with_value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }

    /// Attach a gas limit
    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(U256::from(gas));
        self
    }
}

impl From<&TxRequest> for TypedTransaction {
    fn from(tx: &TxRequest) -> Self {
        let mut request = TransactionRequest::new()
            .from(tx.from)
            .data(tx.data.clone());
        if let Some(to) = tx.to {
            request = request.to(to);
        }
        if let Some(value) = tx.value {
            request = request.value(value);
        }
        if let Some(gas) = tx.gas {
            request = request.gas(gas);
        }
        request.into()
    }
}

/// Subset of a transaction receipt the harness relies on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Transaction hash
    pub transaction_hash: H256,
    /// Block the transaction landed in
    #[serde(default)]
    pub block_number: Option<U64>,
    /// 1 for success, 0 for revert
    #[serde(default)]
    pub status: Option<U64>,
    /// Address of a created contract
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Gas consumed
    #[serde(default)]
    pub gas_used: Option<U256>,
}

impl From<TransactionReceipt> for TxReceipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            status: receipt.status,
            contract_address: receipt.contract_address,
            gas_used: receipt.gas_used,
        }
    }
}

impl TxReceipt {
    /// Whether the transaction executed without reverting
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s.as_u64() == 1).unwrap_or(false)
    }
}
