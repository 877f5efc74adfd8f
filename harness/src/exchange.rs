//! Exchange orders and the exchange wrapper allowlist.
//!
//! Swap-bearing actions (boost, repay) carry an ABI-encoded [`ExchangeOrder`]
//! naming the wrapper that performs the trade. Only wrappers on the
//! allowlist are accepted, so a test that swaps through a mock wrapper first
//! adds it with [`WrapperRegistry::add_wrapper`] and then builds the order
//! with [`ExchangeOrder::mock`].

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::impersonate::Impersonator;
use crate::receipt::ReceiptWatcher;
use crate::registry::ContractHandle;
use crate::rpc::NodeRpcClient;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use tracing::{debug, info};

/// Registry name of the mock wrapper that trades at a quoted rate
pub const MOCK_EXCHANGE_WRAPPER: &str = "MockExchangeWrapper";

/// Quote data for aggregator-backed trades; zeroed for wrapper-only orders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffchainData {
    /// Offchain wrapper contract
    pub wrapper: Address,
    /// Aggregator the call data targets
    pub exchange_addr: Address,
    /// Spender to approve for the sold token
    pub allowance_target: Address,
    /// Quoted price
    pub price: U256,
    /// Aggregator fee in native units
    pub protocol_fee: U256,
    /// Aggregator call data
    pub call_data: Bytes,
}

impl OffchainData {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.wrapper),
            Token::Address(self.exchange_addr),
            Token::Address(self.allowance_target),
            Token::Uint(self.price),
            Token::Uint(self.protocol_fee),
            Token::Bytes(self.call_data.to_vec()),
        ])
    }
}

/// One trade of `src_amount` of `src` into `dest` through `wrapper`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOrder {
    /// Token sold
    pub src: Address,
    /// Token bought
    pub dest: Address,
    /// Amount sold, in `src` base units
    pub src_amount: U256,
    /// Exact amount bought for buy orders; zero for sells
    pub dest_amount: U256,
    /// Worst accepted price (scaled by 10^18); zero disables the check
    pub min_price: U256,
    /// Fee divider; zero charges no fee
    pub dfs_fee_divider: U256,
    /// Account the trade is made for
    pub user: Address,
    /// Wrapper contract that performs the trade
    pub wrapper: Address,
    /// Wrapper-specific payload
    pub wrapper_data: Bytes,
    /// Aggregator quote
    pub offchain: OffchainData,
}

impl ExchangeOrder {
    /// Sell order through the mock wrapper at `rate`.
    ///
    /// `rate` is `dest` base units per `src` base unit scaled by 10^18 and is
    /// handed to the wrapper as its only payload.
    pub fn mock(src: Address, dest: Address, src_amount: U256, wrapper: Address, rate: U256) -> Self {
        Self {
            src,
            dest,
            src_amount,
            dest_amount: U256::zero(),
            min_price: U256::zero(),
            dfs_fee_divider: U256::zero(),
            user: Address::zero(),
            wrapper,
            wrapper_data: Bytes::from(abi::encode(&[Token::Uint(rate)])),
            offchain: OffchainData::default(),
        }
    }

    /// Rate carried by a mock order
    pub fn mock_rate(&self) -> Result<U256> {
        abi::decode(&[ParamType::Uint(256)], &self.wrapper_data)?
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| HarnessError::InvalidResponse("wrapper data carries no rate".to_string()))
    }

    /// `dest` base units the mock wrapper pays for this order
    pub fn expected_output(&self) -> Result<U256> {
        let rate = self.mock_rate()?;
        self.src_amount
            .checked_mul(rate)
            .map(|v| v / U256::exp10(18))
            .ok_or_else(|| {
                HarnessError::InvalidAmount(format!(
                    "{} at rate {} overflows",
                    self.src_amount, rate
                ))
            })
    }

    /// Order as a single ABI tuple
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.src),
            Token::Address(self.dest),
            Token::Uint(self.src_amount),
            Token::Uint(self.dest_amount),
            Token::Uint(self.min_price),
            Token::Uint(self.dfs_fee_divider),
            Token::Address(self.user),
            Token::Address(self.wrapper),
            Token::Bytes(self.wrapper_data.to_vec()),
            self.offchain.to_token(),
        ])
    }

    /// ABI encoding carried as an action's exchange data
    pub fn encode(&self) -> Bytes {
        Bytes::from(abi::encode(&[self.to_token()]))
    }
}

/// Client for the exchange wrapper allowlist
pub struct WrapperRegistry {
    rpc: NodeRpcClient,
    watcher: ReceiptWatcher,
    address: Address,
    owner: Address,
    gas_limit: u64,
    top_up_wei: U256,
}

impl WrapperRegistry {
    /// Create a client for the configured allowlist
    pub fn new(rpc: NodeRpcClient, watcher: ReceiptWatcher, config: &HarnessConfig) -> Self {
        Self {
            rpc,
            watcher,
            address: config.wrapper_registry,
            owner: config.wrapper_registry_owner,
            gas_limit: config.gas_limit,
            top_up_wei: config.top_up_wei,
        }
    }

    /// Allowlist contract address
    pub fn address(&self) -> Address {
        self.address
    }

    fn handle(&self) -> Result<ContractHandle> {
        if self.address.is_zero() {
            return Err(HarnessError::ConfigError(
                "Wrapper registry address must be set".to_string(),
            ));
        }
        Ok(ContractHandle {
            name: "WrapperExchangeRegistry".to_string(),
            address: self.address,
            abi: wrapper_registry_abi()?,
        })
    }

    /// Whether `wrapper` is on the allowlist
    pub async fn is_wrapper(&self, wrapper: Address) -> Result<bool> {
        self.handle()?
            .call(&self.rpc, self.owner, "isWrapper", &[Token::Address(wrapper)])
            .await?
            .into_iter()
            .next()
            .and_then(Token::into_bool)
            .ok_or_else(|| HarnessError::InvalidResponse("expected a bool".to_string()))
    }

    /// Add `wrapper` to the allowlist as its owner.
    ///
    /// The owner is impersonated and, on a fork, topped up for gas.
    pub async fn add_wrapper(
        &self,
        impersonator: &mut Impersonator,
        wrapper: Address,
        is_fork: bool,
    ) -> Result<()> {
        let handle = self.handle()?;
        impersonator.impersonate(self.owner).await?;
        if is_fork {
            self.rpc.set_balance(self.owner, self.top_up_wei).await?;
            debug!("Topped up {:?} with {} wei", self.owner, self.top_up_wei);
        }

        handle
            .send(
                &self.rpc,
                &self.watcher,
                self.owner,
                "addWrapper",
                &[Token::Address(wrapper)],
                self.gas_limit,
            )
            .await?;

        info!("Allowlisted exchange wrapper {:?}", wrapper);
        Ok(())
    }
}

fn wrapper_registry_abi() -> Result<abi::Abi> {
    abi::parse_abi(&[
        "function addWrapper(address _wrapper)",
        "function isWrapper(address _wrapper) view returns (bool)",
    ])
    .map_err(|e| HarnessError::InvalidResponse(format!("wrapper registry ABI: {}", e)))
}
