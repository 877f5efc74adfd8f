//! Protocol actions and their execution through an owner's proxy.
//!
//! Every action kind is one variant of [`Action`] with typed parameters, so
//! shape problems (zero market, unknown rate mode, empty claim list) are caught
//! before anything reaches the ledger. Executing an action resolves the action
//! contract by name in the registry and sends
//! `proxy.execute(action, executeActionDirect(params))` from the proxy owner.
//! A [`Recipe`] chains several actions into one all-or-nothing call through the
//! registry's `RecipeExecutor`.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::impersonate::Impersonator;
use crate::proxy::ProxyHandle;
use crate::receipt::ReceiptWatcher;
use crate::registry::{calldata, RegistryResolver};
use crate::rpc::NodeRpcClient;
use crate::types::{RegistryId, TxReceipt, TxRequest};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

/// Aave stable borrow rate
pub const STABLE_RATE: u8 = 1;
/// Aave variable borrow rate
pub const VARIABLE_RATE: u8 = 2;

/// Selector of Solidity's `Error(string)`
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Registry name of the recipe executor
pub const RECIPE_EXECUTOR: &str = "RecipeExecutor";

/// One protocol operation with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Supply `amount` of `asset` pulled from `from`
    AaveSupply {
        /// Lending pool address provider
        market: Address,
        /// Underlying asset
        asset: Address,
        /// Amount in base units
        amount: U256,
        /// Account the asset is pulled from
        from: Address,
        /// Account credited with the deposit (zero for the proxy)
        on_behalf_of: Address,
        /// Enable the asset as collateral
        enable_as_coll: bool,
    },
    /// Withdraw `amount` of `asset` to `to`
    AaveWithdraw {
        /// Lending pool address provider
        market: Address,
        /// Underlying asset
        asset: Address,
        /// Amount in base units, `U256::MAX` for everything
        amount: U256,
        /// Recipient
        to: Address,
    },
    /// Borrow `amount` of `asset`
    AaveBorrow {
        /// Lending pool address provider
        market: Address,
        /// Asset to borrow
        asset: Address,
        /// Amount in base units
        amount: U256,
        /// [`STABLE_RATE`] or [`VARIABLE_RATE`]
        rate_mode: u8,
        /// Recipient
        to: Address,
        /// Debtor (zero for the proxy)
        on_behalf_of: Address,
    },
    /// Repay `amount` of `asset` debt
    AavePayback {
        /// Lending pool address provider
        market: Address,
        /// Debt asset
        asset: Address,
        /// Amount in base units, `U256::MAX` for the whole debt
        amount: U256,
        /// [`STABLE_RATE`] or [`VARIABLE_RATE`]
        rate_mode: u8,
        /// Account the repayment is pulled from
        from: Address,
        /// Debtor (zero for the proxy)
        on_behalf_of: Address,
    },
    /// Claim stkAAVE incentives accrued on `assets`
    AaveClaimStkAave {
        /// aTokens/debt tokens to claim for
        assets: Vec<Address>,
        /// Amount to claim; zero is allowed
        amount: U256,
        /// Recipient
        to: Address,
    },
    /// Claim AAVE rewards earned by staked AAVE
    AaveClaimAave {
        /// Amount to claim; zero is allowed
        amount: U256,
        /// Recipient
        to: Address,
    },
    /// Start the stkAAVE cooldown
    AaveStartUnstake,
    /// Redeem stkAAVE after the cooldown
    AaveFinalizeUnstake {
        /// Recipient of the AAVE
        to: Address,
        /// Amount to redeem, `U256::MAX` for everything
        amount: U256,
    },
    /// Wrap native value into WETH; the amount is attached as `msg.value`
    WrapEth {
        /// Amount in wei
        amount: U256,
    },
    /// Open a Liquity trove
    LiquityOpen {
        /// Max borrowing fee (18 decimals)
        max_fee_percentage: U256,
        /// WETH collateral pulled from `from`
        coll_amount: U256,
        /// LUSD to draw
        lusd_amount: U256,
        /// Collateral source
        from: Address,
        /// LUSD recipient
        to: Address,
        /// Sorted-trove insertion hint
        upper_hint: Address,
        /// Sorted-trove insertion hint
        lower_hint: Address,
    },
    /// Repay LUSD debt of a Liquity trove
    LiquityPayback {
        /// LUSD to repay
        lusd_amount: U256,
        /// LUSD source
        from: Address,
        /// Sorted-trove insertion hint
        upper_hint: Address,
        /// Sorted-trove insertion hint
        lower_hint: Address,
    },
    /// Open a LlamaLend position
    LlamaLendCreate {
        /// Market controller
        controller: Address,
        /// Collateral source
        from: Address,
        /// Debt recipient
        to: Address,
        /// Collateral amount
        coll_amount: U256,
        /// Debt amount
        debt_amount: U256,
        /// Number of liquidation bands
        n_bands: u64,
    },
    /// Leverage up a LlamaLend position by swapping borrowed debt into collateral
    LlamaLendBoost {
        /// Market controller
        controller: Address,
        /// Encoded exchange order
        exchange_data: Bytes,
        /// Gas reported to the fee taker
        gas_used: u32,
    },
}

fn zero_address(action: &str, field: &str, value: Address) -> Result<()> {
    if value.is_zero() {
        return Err(HarnessError::InvalidAction {
            action: action.to_string(),
            reason: format!("{} must not be the zero address", field),
        });
    }
    Ok(())
}

fn zero_amount(action: &str, field: &str, value: U256) -> Result<()> {
    if value.is_zero() {
        return Err(HarnessError::InvalidAction {
            action: action.to_string(),
            reason: format!("{} must be greater than zero", field),
        });
    }
    Ok(())
}

fn rate_mode(action: &str, mode: u8) -> Result<()> {
    if mode != STABLE_RATE && mode != VARIABLE_RATE {
        return Err(HarnessError::InvalidAction {
            action: action.to_string(),
            reason: format!("rate mode {} is neither stable (1) nor variable (2)", mode),
        });
    }
    Ok(())
}

impl Action {
    /// Logical name the action contract is registered under
    pub fn name(&self) -> &'static str {
        match self {
            Action::AaveSupply { .. } => "AaveSupply",
            Action::AaveWithdraw { .. } => "AaveWithdraw",
            Action::AaveBorrow { .. } => "AaveBorrow",
            Action::AavePayback { .. } => "AavePayback",
            Action::AaveClaimStkAave { .. } => "AaveClaimStkAave",
            Action::AaveClaimAave { .. } => "AaveClaimAAVE",
            Action::AaveStartUnstake => "AaveStartUnstake",
            Action::AaveFinalizeUnstake { .. } => "AaveFinalizeUnstake",
            Action::WrapEth { .. } => "WrapEth",
            Action::LiquityOpen { .. } => "LiquityOpen",
            Action::LiquityPayback { .. } => "LiquityPayback",
            Action::LlamaLendCreate { .. } => "LlamaLendCreate",
            Action::LlamaLendBoost { .. } => "LlamaLendBoost",
        }
    }

    /// Registry id of the action contract
    pub fn id(&self) -> RegistryId {
        RegistryId::from_name(self.name())
    }

    /// Check parameter shape before dispatch
    pub fn validate(&self) -> Result<()> {
        let name = self.name();
        match self {
            Action::AaveSupply {
                market,
                asset,
                amount,
                ..
            }
            | Action::AaveWithdraw {
                market,
                asset,
                amount,
                ..
            } => {
                zero_address(name, "market", *market)?;
                zero_address(name, "asset", *asset)?;
                zero_amount(name, "amount", *amount)
            }
            Action::AaveBorrow {
                market,
                asset,
                amount,
                rate_mode: mode,
                ..
            }
            | Action::AavePayback {
                market,
                asset,
                amount,
                rate_mode: mode,
                ..
            } => {
                zero_address(name, "market", *market)?;
                zero_address(name, "asset", *asset)?;
                zero_amount(name, "amount", *amount)?;
                rate_mode(name, *mode)
            }
            Action::AaveClaimStkAave { assets, to, .. } => {
                if assets.is_empty() {
                    return Err(HarnessError::InvalidAction {
                        action: name.to_string(),
                        reason: "no assets to claim for".to_string(),
                    });
                }
                zero_address(name, "to", *to)
            }
            Action::AaveClaimAave { to, .. } | Action::AaveFinalizeUnstake { to, .. } => {
                zero_address(name, "to", *to)
            }
            Action::AaveStartUnstake => Ok(()),
            Action::WrapEth { amount } => zero_amount(name, "amount", *amount),
            Action::LiquityOpen {
                coll_amount,
                lusd_amount,
                ..
            } => {
                zero_amount(name, "coll_amount", *coll_amount)?;
                zero_amount(name, "lusd_amount", *lusd_amount)
            }
            Action::LiquityPayback { lusd_amount, .. } => {
                zero_amount(name, "lusd_amount", *lusd_amount)
            }
            Action::LlamaLendCreate {
                controller,
                coll_amount,
                debt_amount,
                n_bands,
                ..
            } => {
                zero_address(name, "controller", *controller)?;
                zero_amount(name, "coll_amount", *coll_amount)?;
                zero_amount(name, "debt_amount", *debt_amount)?;
                if !(4..=50).contains(n_bands) {
                    return Err(HarnessError::InvalidAction {
                        action: name.to_string(),
                        reason: format!("{} bands is outside 4..=50", n_bands),
                    });
                }
                Ok(())
            }
            Action::LlamaLendBoost {
                controller,
                exchange_data,
                ..
            } => {
                zero_address(name, "controller", *controller)?;
                if exchange_data.is_empty() {
                    return Err(HarnessError::InvalidAction {
                        action: name.to_string(),
                        reason: "exchange data is empty".to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    fn params(&self) -> Vec<Token> {
        use Token::{Address as A, Bool, Uint};

        match self {
            Action::AaveSupply {
                market,
                asset,
                amount,
                from,
                on_behalf_of,
                enable_as_coll,
            } => vec![
                A(*market),
                A(*asset),
                Uint(*amount),
                A(*from),
                A(*on_behalf_of),
                Bool(*enable_as_coll),
            ],
            Action::AaveWithdraw {
                market,
                asset,
                amount,
                to,
            } => vec![A(*market), A(*asset), Uint(*amount), A(*to)],
            Action::AaveBorrow {
                market,
                asset,
                amount,
                rate_mode,
                to,
                on_behalf_of,
            } => vec![
                A(*market),
                A(*asset),
                Uint(*amount),
                Uint(U256::from(*rate_mode)),
                A(*to),
                A(*on_behalf_of),
            ],
            Action::AavePayback {
                market,
                asset,
                amount,
                rate_mode,
                from,
                on_behalf_of,
            } => vec![
                A(*market),
                A(*asset),
                Uint(*amount),
                Uint(U256::from(*rate_mode)),
                A(*from),
                A(*on_behalf_of),
            ],
            Action::AaveClaimStkAave { assets, amount, to } => vec![
                Token::Array(assets.iter().copied().map(A).collect()),
                Uint(*amount),
                A(*to),
            ],
            Action::AaveClaimAave { amount, to } => vec![Uint(*amount), A(*to)],
            Action::AaveStartUnstake => vec![],
            Action::AaveFinalizeUnstake { to, amount } => vec![A(*to), Uint(*amount)],
            Action::WrapEth { amount } => vec![Uint(*amount)],
            Action::LiquityOpen {
                max_fee_percentage,
                coll_amount,
                lusd_amount,
                from,
                to,
                upper_hint,
                lower_hint,
            } => vec![
                Uint(*max_fee_percentage),
                Uint(*coll_amount),
                Uint(*lusd_amount),
                A(*from),
                A(*to),
                A(*upper_hint),
                A(*lower_hint),
            ],
            Action::LiquityPayback {
                lusd_amount,
                from,
                upper_hint,
                lower_hint,
            } => vec![Uint(*lusd_amount), A(*from), A(*upper_hint), A(*lower_hint)],
            Action::LlamaLendCreate {
                controller,
                from,
                to,
                coll_amount,
                debt_amount,
                n_bands,
            } => vec![
                A(*controller),
                A(*from),
                A(*to),
                Uint(*coll_amount),
                Uint(*debt_amount),
                Uint(U256::from(*n_bands)),
            ],
            Action::LlamaLendBoost {
                controller,
                exchange_data,
                gas_used,
            } => vec![
                A(*controller),
                Token::Bytes(exchange_data.to_vec()),
                Uint(U256::from(*gas_used)),
            ],
        }
    }

    /// ABI-encoded parameter tuple
    pub fn encode_params(&self) -> Bytes {
        Bytes::from(abi::encode(&[Token::Tuple(self.params())]))
    }

    /// Calldata for `executeActionDirect(bytes)` on the action contract
    pub fn encode_direct_call(&self) -> Bytes {
        calldata(
            "executeActionDirect(bytes)",
            &[Token::Bytes(self.encode_params().to_vec())],
        )
    }

    /// Native value the call must carry
    pub fn value(&self) -> U256 {
        match self {
            Action::WrapEth { amount } => *amount,
            _ => U256::zero(),
        }
    }

    fn param_count(&self) -> usize {
        self.params().len()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Several actions executed atomically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    /// Label reported on revert
    pub name: String,
    /// Actions in execution order
    pub actions: Vec<Action>,
}

impl Recipe {
    /// Create an empty recipe
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    /// Append an action
    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Validate every step
    pub fn validate(&self) -> Result<()> {
        if self.actions.is_empty() {
            return Err(HarnessError::InvalidAction {
                action: self.name.clone(),
                reason: "recipe has no actions".to_string(),
            });
        }
        self.actions.iter().try_for_each(Action::validate)
    }

    /// Native value the recipe must carry
    pub fn value(&self) -> U256 {
        self.actions
            .iter()
            .fold(U256::zero(), |total, action| total.saturating_add(action.value()))
    }

    /// Calldata for `executeRecipe((string,bytes[],bytes32[],bytes4[],uint8[][]))`
    pub fn encode_call(&self) -> Bytes {
        let call_data = self
            .actions
            .iter()
            .map(|a| Token::Bytes(a.encode_params().to_vec()))
            .collect();
        let action_ids = self
            .actions
            .iter()
            .map(|a| Token::FixedBytes(a.id().0.to_vec()))
            .collect();
        // No piping between steps: every parameter is taken as encoded
        let param_mapping = self
            .actions
            .iter()
            .map(|a| Token::Array(vec![Token::Uint(U256::zero()); a.param_count()]))
            .collect();

        calldata(
            "executeRecipe((string,bytes[],bytes32[],bytes4[],uint8[][]))",
            &[Token::Tuple(vec![
                Token::String(self.name.clone()),
                Token::Array(call_data),
                Token::Array(vec![]),
                Token::Array(action_ids),
                Token::Array(param_mapping),
            ])],
        )
    }
}

/// Result of a mined action transaction
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Transaction hash
    pub tx_hash: H256,
    /// Mined receipt
    pub receipt: TxReceipt,
}

/// Pull a revert reason out of a node error.
///
/// Only errors the node attributes to EVM execution count: an `Error(string)`
/// payload, other revert data, or a message naming a revert. Everything else
/// (unknown sender, nonce or funding problems) yields `None`.
pub fn revert_reason(error: &HarnessError) -> Option<String> {
    match error {
        HarnessError::Rpc { message, data, .. } => {
            if let Some(reason) = data.as_ref().and_then(decode_error_data) {
                return Some(reason);
            }
            let has_revert_data = matches!(
                data.as_ref().and_then(error_data_hex),
                Some(hex) if hex.starts_with("0x") && hex.len() > 2
            );
            if has_revert_data || message.to_lowercase().contains("revert") {
                Some(message.clone())
            } else {
                None
            }
        }
        _ => None,
    }
}

fn error_data_hex(data: &Value) -> Option<&str> {
    match data {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("data")?.as_str(),
        _ => None,
    }
}

fn decode_error_data(data: &Value) -> Option<String> {
    let hex_data = error_data_hex(data)?;
    let bytes = hex::decode(hex_data.trim_start_matches("0x")).ok()?;
    if bytes.len() < 4 || bytes[..4] != ERROR_STRING_SELECTOR {
        return None;
    }
    abi::decode(&[ParamType::String], &bytes[4..])
        .ok()?
        .into_iter()
        .next()?
        .into_string()
}

/// Sends actions and recipes through proxies
pub struct ActionExecutor {
    rpc: NodeRpcClient,
    watcher: ReceiptWatcher,
    gas_limit: u64,
    simulate: bool,
}

impl ActionExecutor {
    /// Create an executor
    pub fn new(rpc: NodeRpcClient, watcher: ReceiptWatcher, config: &HarnessConfig) -> Self {
        Self {
            rpc,
            watcher,
            gas_limit: config.gas_limit,
            simulate: config.simulate_before_send,
        }
    }

    /// Execute a single action through `proxy`
    pub async fn execute(
        &self,
        registry: &RegistryResolver,
        impersonator: &mut Impersonator,
        proxy: ProxyHandle,
        action: &Action,
    ) -> Result<ActionOutcome> {
        action.validate()?;
        let target = registry.get_addr_from_registry(action.name()).await?;

        info!("Executing {} through proxy {:?}", action, proxy.address);
        self.dispatch(
            impersonator,
            proxy,
            action.name(),
            target,
            action.encode_direct_call(),
            action.value(),
        )
        .await
    }

    /// Execute every action of `recipe` in one atomic call
    pub async fn execute_recipe(
        &self,
        registry: &RegistryResolver,
        impersonator: &mut Impersonator,
        proxy: ProxyHandle,
        recipe: &Recipe,
    ) -> Result<ActionOutcome> {
        recipe.validate()?;
        // Every step must resolve before anything is sent
        for action in &recipe.actions {
            registry.get_addr_from_registry(action.name()).await?;
        }
        let executor = registry.get_addr_from_registry(RECIPE_EXECUTOR).await?;

        info!(
            "Executing recipe {} ({} actions) through proxy {:?}",
            recipe.name,
            recipe.actions.len(),
            proxy.address
        );
        self.dispatch(
            impersonator,
            proxy,
            &recipe.name,
            executor,
            recipe.encode_call(),
            recipe.value(),
        )
        .await
    }

    async fn dispatch(
        &self,
        impersonator: &mut Impersonator,
        proxy: ProxyHandle,
        label: &str,
        target: Address,
        inner: Bytes,
        value: U256,
    ) -> Result<ActionOutcome> {
        impersonator.impersonate(proxy.owner).await?;

        let data = calldata(
            "execute(address,bytes)",
            &[Token::Address(target), Token::Bytes(inner.to_vec())],
        );
        let mut tx = TxRequest::call(proxy.owner, proxy.address, data).with_gas(self.gas_limit);
        if !value.is_zero() {
            tx = tx.with_value(value);
        }

        if self.simulate {
            self.rpc
                .eth_call(&tx)
                .await
                .map_err(|e| self.reverted(label, e))?;
        }

        let hash = self
            .rpc
            .send_transaction(&tx)
            .await
            .map_err(|e| self.reverted(label, e))?;
        let receipt = self.watcher.wait(hash).await?;

        if !receipt.succeeded() {
            // Replay against the unchanged state to recover the reason
            let reason = match self.rpc.eth_call(&tx).await {
                Err(e) => revert_reason(&e),
                Ok(_) => None,
            }
            .unwrap_or_else(|| "transaction reverted without a reason".to_string());
            warn!("{} reverted in {:?}: {}", label, hash, reason);
            return Err(HarnessError::ActionReverted {
                action: label.to_string(),
                reason,
            });
        }

        debug!("{} mined in {:?}", label, hash);
        Ok(ActionOutcome {
            tx_hash: hash,
            receipt,
        })
    }

    /// Reverts become action faults; other node and transport errors pass through
    fn reverted(&self, label: &str, error: HarnessError) -> HarnessError {
        match revert_reason(&error) {
            Some(reason) => {
                warn!("{} reverted: {}", label, reason);
                HarnessError::ActionReverted {
                    action: label.to_string(),
                    reason,
                }
            }
            None => error,
        }
    }
}
