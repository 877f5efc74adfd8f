//! In-process fork node for integration tests.
//!
//! `MockLedger` answers the JSON-RPC methods the harness uses against a small
//! simulated EVM world: storage words, native balances, nonces and a handful
//! of contract kinds (ERC-20 tokens with configurable balance layouts, a name
//! registry, a proxy factory, proxies, actions, a recipe executor and an
//! exchange wrapper allowlist).
//! Transactions run against a scratch copy of the world that is committed only
//! on success, which gives the same all-or-nothing behaviour as a real node.

#![allow(dead_code)]

use ethers::abi::{self, Abi, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{get_contract_address, id, keccak256};
use fork_harness::{
    AssetInfo, ForkHarness, HarnessConfig, InMemoryArtifacts, SlotLayout, StaticPriceTable,
    TxRequest,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const CHAIN_ID: u64 = 1;
pub const START_BLOCK: u64 = 17_970_305;
pub const LATEST_UPSTREAM_BLOCK: u64 = 18_500_000;
/// Minimum native balance a sender needs to pay for gas
pub const MIN_GAS_FUNDS: u64 = 10_000_000_000_000_000;

pub const REGISTRY: Address = Address::repeat_byte(0x10);
pub const REGISTRY_OWNER: Address = Address::repeat_byte(0x11);
pub const PROXY_FACTORY: Address = Address::repeat_byte(0x12);
pub const DEPLOYER: Address = Address::repeat_byte(0x13);
pub const AAVE_MARKET: Address = Address::repeat_byte(0x14);
pub const WRAPPER_REGISTRY: Address = Address::repeat_byte(0x15);
pub const WRAPPER_REGISTRY_OWNER: Address = Address::repeat_byte(0x16);

/// Solidity balances at slot 3, known to the asset book
pub const WETH: Address = Address::repeat_byte(0x20);
/// Solidity balances at slot 9, found by probing
pub const USDC: Address = Address::repeat_byte(0x21);
/// Vyper balances at slot 1
pub const CRV: Address = Address::repeat_byte(0x22);
/// Balances beyond any probe bound
pub const OPAQUE: Address = Address::repeat_byte(0x23);
/// Receipt token minted by the supply action
pub const AWETH: Address = Address::repeat_byte(0x24);
/// Balance in the low 96 bits of a Solidity slot 4 word shared with another field
pub const PACKED: Address = Address::repeat_byte(0x25);
/// Solidity slot 2; `balanceOf` reverts once a balance exceeds one token
pub const CAPPED: Address = Address::repeat_byte(0x26);
/// Bits of the packed token's balance field
pub const PACKED_BALANCE_BITS: usize = 96;

pub const USER: Address = Address::repeat_byte(0x30);
pub const OTHER_USER: Address = Address::repeat_byte(0x31);

/// Revert reason of the borrow action fixture (Aave's "collateral cannot cover")
pub const BORROW_REVERT: &str = "11";

#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Erc20(SlotLayout),
    PackedErc20 { layout: SlotLayout, bits: usize },
    CappedErc20 { layout: SlotLayout, cap: U256 },
    Registry { owner: Address },
    WrapperRegistry { owner: Address },
    ProxyFactory,
    Proxy { owner: Address },
    SupplyAction { receipt_token: Address },
    RevertingAction { reason: String },
    RecipeExecutor { registry: Address },
    Generic,
}

#[derive(Debug, Clone, Default)]
struct World {
    storage: HashMap<Address, HashMap<H256, H256>>,
    balances: HashMap<Address, U256>,
    code: HashMap<Address, Kind>,
    nonces: HashMap<Address, u64>,
    block: u64,
    time_offset: u64,
}

fn word_from_u256(value: U256) -> H256 {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    H256(buf)
}

fn word_from_address(address: Address) -> H256 {
    let mut buf = [0u8; 32];
    buf[12..].copy_from_slice(address.as_bytes());
    H256(buf)
}

fn hash_key(tokens: &[Token]) -> H256 {
    H256(keccak256(abi::encode(tokens)))
}

fn allowance_key(owner: Address, spender: Address) -> H256 {
    hash_key(&[
        Token::Address(owner),
        Token::Address(spender),
        Token::Uint(U256::from(1000)),
    ])
}

fn registry_key(id: &[u8]) -> H256 {
    hash_key(&[Token::FixedBytes(id.to_vec()), Token::Uint(U256::zero())])
}

fn proxy_key(owner: Address) -> H256 {
    hash_key(&[Token::Address(owner), Token::Uint(U256::zero())])
}

fn wrapper_key(wrapper: Address) -> H256 {
    hash_key(&[Token::Address(wrapper), Token::Uint(U256::one())])
}

impl World {
    fn load(&self, account: Address, key: H256) -> H256 {
        self.storage
            .get(&account)
            .and_then(|words| words.get(&key))
            .copied()
            .unwrap_or_default()
    }

    fn store(&mut self, account: Address, key: H256, value: H256) {
        let words = self.storage.entry(account).or_default();
        if value.is_zero() {
            words.remove(&key);
        } else {
            words.insert(key, value);
        }
    }

    fn load_u256(&self, account: Address, key: H256) -> U256 {
        U256::from_big_endian(self.load(account, key).as_bytes())
    }

    fn load_address(&self, account: Address, key: H256) -> Address {
        Address::from_slice(&self.load(account, key).as_bytes()[12..])
    }

    fn balance(&self, account: Address) -> U256 {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    fn nonce(&self, account: Address) -> u64 {
        self.nonces.get(&account).copied().unwrap_or_default()
    }

    fn token_kind(&self, token: Address) -> Result<Kind, String> {
        match self.code.get(&token) {
            Some(
                kind @ (Kind::Erc20(_) | Kind::PackedErc20 { .. } | Kind::CappedErc20 { .. }),
            ) => Ok(kind.clone()),
            _ => Err(format!("{:?} is not a token", token)),
        }
    }

    fn token_balance(&self, token: Address, holder: Address) -> Result<U256, String> {
        match self.token_kind(token)? {
            Kind::PackedErc20 { layout, bits } => {
                let mask = (U256::one() << bits) - 1;
                Ok(self.load_u256(token, layout.storage_key(holder)) & mask)
            }
            Kind::CappedErc20 { layout, cap } => {
                let balance = self.load_u256(token, layout.storage_key(holder));
                if balance > cap {
                    return Err("balance exceeds cap".to_string());
                }
                Ok(balance)
            }
            Kind::Erc20(layout) => Ok(self.load_u256(token, layout.storage_key(holder))),
            _ => Err(format!("{:?} is not a token", token)),
        }
    }

    fn set_token_balance(&mut self, token: Address, holder: Address, amount: U256) -> Result<(), String> {
        match self.token_kind(token)? {
            Kind::PackedErc20 { layout, bits } => {
                let key = layout.storage_key(holder);
                let mask = (U256::one() << bits) - 1;
                if amount > mask {
                    return Err("balance overflows packed field".to_string());
                }
                let packed = (self.load_u256(token, key) & !mask) | amount;
                self.store(token, key, word_from_u256(packed));
            }
            Kind::Erc20(layout) | Kind::CappedErc20 { layout, .. } => {
                self.store(token, layout.storage_key(holder), word_from_u256(amount));
            }
            _ => return Err(format!("{:?} is not a token", token)),
        }
        Ok(())
    }
}

struct Outcome {
    output: Vec<u8>,
    created: Option<Address>,
}

struct RpcFailure {
    code: i64,
    message: String,
    data: Option<Value>,
}

fn failure(code: i64, message: impl Into<String>) -> RpcFailure {
    RpcFailure {
        code,
        message: message.into(),
        data: None,
    }
}

/// Hardhat-style revert error carrying `Error(string)` data
fn revert_failure(reason: String) -> RpcFailure {
    let mut data = id("Error(string)").to_vec();
    data.extend(abi::encode(&[Token::String(reason.clone())]));
    RpcFailure {
        code: -32603,
        message: format!(
            "VM Exception while processing transaction: reverted with reason string '{}'",
            reason
        ),
        data: Some(json!(format!("0x{}", hex::encode(data)))),
    }
}

fn param<T: serde::de::DeserializeOwned>(params: &Value, index: usize) -> Result<T, RpcFailure> {
    serde_json::from_value(params[index].clone())
        .map_err(|e| failure(-32602, format!("invalid param {}: {}", index, e)))
}

fn quantity_key(params: &Value, index: usize) -> Result<H256, RpcFailure> {
    let slot: U256 = param(params, index)?;
    Ok(word_from_u256(slot))
}

fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, String> {
    abi::decode(types, data).map_err(|e| format!("abi decode failed: {}", e))
}

fn selector(signature: &str) -> [u8; 4] {
    id(signature)
}

struct State {
    world: World,
    upstream: World,
    snapshots: Vec<(u64, World)>,
    next_snapshot: u64,
    impersonated: HashSet<Address>,
    receipts: HashMap<H256, Value>,
    transactions: HashMap<H256, Value>,
    drop_transactions: bool,
    templates: Vec<(Vec<u8>, Kind)>,
    calls: Vec<String>,
    pending_polls: u32,
    mine_reverts: bool,
    tx_counter: u64,
}

impl State {
    fn handle(&mut self, method: &str, params: &Value) -> Result<Value, RpcFailure> {
        let cheat = method
            .strip_prefix("hardhat_")
            .or_else(|| method.strip_prefix("anvil_"));

        match (method, cheat) {
            (_, Some("reset")) => self.reset(params),
            (_, Some("impersonateAccount")) => {
                let account: Address = param(params, 0)?;
                self.impersonated.insert(account);
                Ok(json!(true))
            }
            (_, Some("stopImpersonatingAccount")) => {
                let account: Address = param(params, 0)?;
                self.impersonated.remove(&account);
                Ok(json!(true))
            }
            (_, Some("setStorageAt")) => {
                let account: Address = param(params, 0)?;
                let key = quantity_key(params, 1)?;
                let value: H256 = param(params, 2)?;
                self.world.store(account, key, value);
                Ok(json!(true))
            }
            (_, Some("setBalance")) => {
                let account: Address = param(params, 0)?;
                let amount: U256 = param(params, 1)?;
                self.world.balances.insert(account, amount);
                Ok(json!(true))
            }
            ("eth_chainId", _) => Ok(json!(format!("{:#x}", CHAIN_ID))),
            ("eth_blockNumber", _) => Ok(json!(format!("{:#x}", self.world.block))),
            ("eth_getBalance", _) => {
                let account: Address = param(params, 0)?;
                Ok(json!(self.world.balance(account)))
            }
            ("eth_getCode", _) => {
                let account: Address = param(params, 0)?;
                let code = if self.world.code.contains_key(&account) { "0x00" } else { "0x" };
                Ok(json!(code))
            }
            ("eth_getStorageAt", _) => {
                let account: Address = param(params, 0)?;
                let key = quantity_key(params, 1)?;
                Ok(json!(self.world.load(account, key)))
            }
            ("eth_call", _) => {
                let tx: TxRequest = param(params, 0)?;
                let mut scratch = self.world.clone();
                self.execute(&mut scratch, &tx)
                    .map(|outcome| json!(Bytes::from(outcome.output)))
                    .map_err(revert_failure)
            }
            ("eth_sendTransaction", _) => self.send(params),
            ("eth_getTransactionByHash", _) => {
                let hash: H256 = param(params, 0)?;
                if self.drop_transactions {
                    return Ok(Value::Null);
                }
                Ok(self.transactions.get(&hash).cloned().unwrap_or(Value::Null))
            }
            ("eth_getTransactionReceipt", _) => {
                let hash: H256 = param(params, 0)?;
                if self.pending_polls > 0 {
                    self.pending_polls -= 1;
                    return Ok(Value::Null);
                }
                Ok(self.receipts.get(&hash).cloned().unwrap_or(Value::Null))
            }
            ("evm_snapshot", _) => {
                self.next_snapshot += 1;
                self.snapshots.push((self.next_snapshot, self.world.clone()));
                Ok(json!(format!("{:#x}", self.next_snapshot)))
            }
            ("evm_revert", _) => {
                let id: String = param(params, 0)?;
                let id = u64::from_str_radix(id.trim_start_matches("0x"), 16)
                    .map_err(|e| failure(-32602, e.to_string()))?;
                match self.snapshots.iter().position(|(s, _)| *s == id) {
                    Some(position) => {
                        self.world = self.snapshots[position].1.clone();
                        self.snapshots.truncate(position);
                        Ok(json!(true))
                    }
                    None => Ok(json!(false)),
                }
            }
            ("evm_increaseTime", _) => {
                let seconds: u64 = param(params, 0)?;
                self.world.time_offset += seconds;
                Ok(json!(self.world.time_offset))
            }
            ("evm_mine", _) => {
                self.world.block += 1;
                Ok(json!("0x0"))
            }
            _ => Err(failure(-32601, format!("Method {} not found", method))),
        }
    }

    fn reset(&mut self, params: &Value) -> Result<Value, RpcFailure> {
        let forking = &params[0]["forking"];
        let url = forking["jsonRpcUrl"].as_str().unwrap_or_default();
        let block = forking["blockNumber"].as_u64().unwrap_or_default();

        if url.is_empty() {
            return Err(failure(-32602, "missing jsonRpcUrl"));
        }
        if block > LATEST_UPSTREAM_BLOCK {
            return Err(failure(
                -32000,
                format!("Trying to fork from block {} which is unknown upstream", block),
            ));
        }

        self.world = self.upstream.clone();
        self.world.block = block;
        self.snapshots.clear();
        self.impersonated.clear();
        Ok(json!(true))
    }

    fn send(&mut self, params: &Value) -> Result<Value, RpcFailure> {
        let tx: TxRequest = param(params, 0)?;

        if !self.impersonated.contains(&tx.from) {
            return Err(failure(-32000, format!("unknown account {:?}", tx.from)));
        }
        let needed = U256::from(MIN_GAS_FUNDS) + tx.value.unwrap_or_default();
        if self.world.balance(tx.from) < needed {
            return Err(failure(
                -32000,
                "sender doesn't have enough funds to send tx",
            ));
        }

        let mut scratch = self.world.clone();
        let result = self.execute(&mut scratch, &tx);

        let (status, created) = match result {
            Ok(outcome) => {
                self.world = scratch;
                (1u64, outcome.created)
            }
            Err(reason) if !self.mine_reverts => return Err(revert_failure(reason)),
            Err(_) => (0u64, None),
        };

        *self.world.nonces.entry(tx.from).or_default() += 1;
        self.world.block += 1;
        self.tx_counter += 1;
        let hash = H256(keccak256(self.tx_counter.to_be_bytes()));

        let nonce = self.world.nonce(tx.from) - 1;
        let block_hash = H256(keccak256(self.world.block.to_be_bytes()));
        let block_number = format!("{:#x}", self.world.block);

        self.transactions.insert(
            hash,
            json!({
                "hash": hash,
                "nonce": format!("{:#x}", nonce),
                "blockHash": block_hash,
                "blockNumber": block_number,
                "transactionIndex": "0x0",
                "from": tx.from,
                "to": tx.to,
                "value": tx.value.unwrap_or_default(),
                "gasPrice": "0x3b9aca00",
                "gas": tx.gas.unwrap_or(U256::from(30_000_000u64)),
                "input": tx.data,
                "v": "0x1",
                "r": "0x1",
                "s": "0x1",
            }),
        );
        self.receipts.insert(
            hash,
            json!({
                "transactionHash": hash,
                "transactionIndex": "0x0",
                "blockHash": block_hash,
                "blockNumber": block_number,
                "from": tx.from,
                "to": tx.to,
                "cumulativeGasUsed": "0x5208",
                "gasUsed": "0x5208",
                "contractAddress": created,
                "logs": [],
                "logsBloom": format!("0x{}", "00".repeat(256)),
                "status": format!("{:#x}", status),
                "type": "0x0",
                "effectiveGasPrice": "0x3b9aca00",
            }),
        );
        Ok(json!(hash))
    }

    fn execute(&self, world: &mut World, tx: &TxRequest) -> Result<Outcome, String> {
        let value = tx.value.unwrap_or_default();

        let Some(to) = tx.to else {
            let kind = self
                .templates
                .iter()
                .find(|(code, _)| tx.data.starts_with(code))
                .map(|(_, kind)| kind.clone())
                .unwrap_or(Kind::Generic);
            let address = get_contract_address(tx.from, world.nonce(tx.from));
            world.code.insert(address, kind);
            return Ok(Outcome {
                output: vec![],
                created: Some(address),
            });
        };

        if !value.is_zero() {
            let balance = world.balance(tx.from);
            if balance < value {
                return Err("insufficient value".to_string());
            }
            world.balances.insert(tx.from, balance - value);
            let credited = world.balance(to) + value;
            world.balances.insert(to, credited);
        }

        let output = self.call(world, tx.from, to, &tx.data)?;
        Ok(Outcome {
            output,
            created: None,
        })
    }

    fn call(&self, world: &mut World, sender: Address, to: Address, data: &[u8]) -> Result<Vec<u8>, String> {
        let Some(kind) = world.code.get(&to).cloned() else {
            return Ok(vec![]);
        };
        if data.len() < 4 {
            return Ok(vec![]);
        }
        let (sel, args) = data.split_at(4);

        match kind {
            Kind::Erc20(_) | Kind::PackedErc20 { .. } | Kind::CappedErc20 { .. } => {
                if sel == selector("balanceOf(address)") {
                    let holder = decode(&[ParamType::Address], args)?[0].clone().into_address().unwrap_or_default();
                    Ok(abi::encode(&[Token::Uint(world.token_balance(to, holder)?)]))
                } else if sel == selector("approve(address,uint256)") {
                    let tokens = decode(&[ParamType::Address, ParamType::Uint(256)], args)?;
                    let spender = tokens[0].clone().into_address().unwrap_or_default();
                    let amount = tokens[1].clone().into_uint().unwrap_or_default();
                    world.store(to, allowance_key(sender, spender), word_from_u256(amount));
                    Ok(abi::encode(&[Token::Bool(true)]))
                } else if sel == selector("allowance(address,address)") {
                    let tokens = decode(&[ParamType::Address, ParamType::Address], args)?;
                    let owner = tokens[0].clone().into_address().unwrap_or_default();
                    let spender = tokens[1].clone().into_address().unwrap_or_default();
                    Ok(abi::encode(&[Token::Uint(world.load_u256(to, allowance_key(owner, spender)))]))
                } else {
                    Err("function selector was not recognized".to_string())
                }
            }
            Kind::Registry { owner } => {
                if sel == selector("resolve(bytes4)") {
                    let id = decode(&[ParamType::FixedBytes(4)], args)?[0].clone().into_fixed_bytes().unwrap_or_default();
                    Ok(abi::encode(&[Token::Address(world.load_address(to, registry_key(&id)))]))
                } else if sel == selector("register(bytes4,address)") {
                    if sender != owner {
                        return Err("Auth: caller is not the owner".to_string());
                    }
                    let tokens = decode(&[ParamType::FixedBytes(4), ParamType::Address], args)?;
                    let id = tokens[0].clone().into_fixed_bytes().unwrap_or_default();
                    let address = tokens[1].clone().into_address().unwrap_or_default();
                    world.store(to, registry_key(&id), word_from_address(address));
                    Ok(vec![])
                } else if sel == selector("owner()") {
                    Ok(abi::encode(&[Token::Address(owner)]))
                } else {
                    Err("function selector was not recognized".to_string())
                }
            }
            Kind::WrapperRegistry { owner } => {
                if sel == selector("isWrapper(address)") {
                    let wrapper = decode(&[ParamType::Address], args)?[0].clone().into_address().unwrap_or_default();
                    Ok(abi::encode(&[Token::Bool(!world.load(to, wrapper_key(wrapper)).is_zero())]))
                } else if sel == selector("addWrapper(address)") {
                    if sender != owner {
                        return Err("Auth: caller is not the owner".to_string());
                    }
                    let wrapper = decode(&[ParamType::Address], args)?[0].clone().into_address().unwrap_or_default();
                    world.store(to, wrapper_key(wrapper), word_from_u256(U256::one()));
                    Ok(vec![])
                } else {
                    Err("function selector was not recognized".to_string())
                }
            }
            Kind::ProxyFactory => {
                if sel == selector("proxies(address)") {
                    let owner = decode(&[ParamType::Address], args)?[0].clone().into_address().unwrap_or_default();
                    Ok(abi::encode(&[Token::Address(world.load_address(to, proxy_key(owner)))]))
                } else if sel == selector("build(address)") {
                    let owner = decode(&[ParamType::Address], args)?[0].clone().into_address().unwrap_or_default();
                    let proxy = get_contract_address(to, world.nonce(to));
                    *world.nonces.entry(to).or_default() += 1;
                    world.code.insert(proxy, Kind::Proxy { owner });
                    world.store(to, proxy_key(owner), word_from_address(proxy));
                    Ok(abi::encode(&[Token::Address(proxy)]))
                } else {
                    Err("function selector was not recognized".to_string())
                }
            }
            Kind::Proxy { owner } => {
                if sel != selector("execute(address,bytes)") {
                    return Err("function selector was not recognized".to_string());
                }
                if sender != owner {
                    return Err("ds-auth-unauthorized".to_string());
                }
                let tokens = decode(&[ParamType::Address, ParamType::Bytes], args)?;
                let target = tokens[0].clone().into_address().unwrap_or_default();
                let inner = tokens[1].clone().into_bytes().unwrap_or_default();
                self.delegate(world, to, target, &inner)
            }
            Kind::Generic => Ok(vec![]),
            _ => Err("actions must be called through a proxy".to_string()),
        }
    }

    /// Run `target`'s code in the proxy's context
    fn delegate(&self, world: &mut World, proxy: Address, target: Address, data: &[u8]) -> Result<Vec<u8>, String> {
        let kind = world
            .code
            .get(&target)
            .cloned()
            .ok_or_else(|| "delegatecall to an account without code".to_string())?;
        if data.len() < 4 {
            return Err("missing selector".to_string());
        }
        let (sel, args) = data.split_at(4);

        match kind {
            Kind::SupplyAction { receipt_token } => {
                if sel != selector("executeActionDirect(bytes)") {
                    return Err("function selector was not recognized".to_string());
                }
                let params = decode(&[ParamType::Bytes], args)?[0].clone().into_bytes().unwrap_or_default();
                supply(world, proxy, receipt_token, &params)
            }
            Kind::RevertingAction { reason } => Err(reason),
            Kind::RecipeExecutor { registry } => {
                if sel != selector("executeRecipe((string,bytes[],bytes32[],bytes4[],uint8[][]))") {
                    return Err("function selector was not recognized".to_string());
                }
                let recipe = decode(
                    &[ParamType::Tuple(vec![
                        ParamType::String,
                        ParamType::Array(Box::new(ParamType::Bytes)),
                        ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                        ParamType::Array(Box::new(ParamType::FixedBytes(4))),
                        ParamType::Array(Box::new(ParamType::Array(Box::new(ParamType::Uint(8))))),
                    ])],
                    args,
                )?[0]
                    .clone()
                    .into_tuple()
                    .unwrap_or_default();
                let call_data = recipe[1].clone().into_array().unwrap_or_default();
                let ids = recipe[3].clone().into_array().unwrap_or_default();

                for (params, action_id) in call_data.into_iter().zip(ids) {
                    let action_id = action_id.into_fixed_bytes().unwrap_or_default();
                    let action = world.load_address(registry, registry_key(&action_id));
                    if action.is_zero() {
                        return Err("Registry: action not found".to_string());
                    }
                    let mut inner = selector("executeActionDirect(bytes)").to_vec();
                    inner.extend(abi::encode(&[params]));
                    self.delegate(world, proxy, action, &inner)?;
                }
                Ok(vec![])
            }
            Kind::Generic => Ok(vec![]),
            _ => Err("delegatecall target is not an action".to_string()),
        }
    }
}

fn supply(world: &mut World, proxy: Address, receipt_token: Address, params: &[u8]) -> Result<Vec<u8>, String> {
    let fields = decode(
        &[ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Address,
            ParamType::Bool,
        ])],
        params,
    )?[0]
        .clone()
        .into_tuple()
        .unwrap_or_default();

    let asset = fields[1].clone().into_address().unwrap_or_default();
    let amount = fields[2].clone().into_uint().unwrap_or_default();
    let from = fields[3].clone().into_address().unwrap_or_default();
    let on_behalf_of = fields[4].clone().into_address().unwrap_or_default();

    let from = if from.is_zero() { proxy } else { from };
    let on_behalf_of = if on_behalf_of.is_zero() { proxy } else { on_behalf_of };

    if from != proxy {
        let allowance = world.load_u256(asset, allowance_key(from, proxy));
        if allowance < amount {
            return Err("ERC20: insufficient allowance".to_string());
        }
        if allowance != U256::MAX {
            world.store(asset, allowance_key(from, proxy), word_from_u256(allowance - amount));
        }
    }

    let balance = world.token_balance(asset, from)?;
    if balance < amount {
        return Err("ERC20: transfer amount exceeds balance".to_string());
    }
    world.set_token_balance(asset, from, balance - amount)?;

    let minted = world.token_balance(receipt_token, on_behalf_of)? + amount;
    world.set_token_balance(receipt_token, on_behalf_of, minted)?;
    Ok(vec![])
}

/// Shared handle to the simulated node
#[derive(Clone)]
pub struct MockLedger {
    state: Arc<Mutex<State>>,
}

impl Respond for MockLedger {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let id = body["id"].clone();
        let method = body["method"].as_str().unwrap_or_default().to_string();

        let mut state = self.state.lock().unwrap();
        state.calls.push(method.clone());

        let payload = match state.handle(&method, &body["params"]) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(e) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": e.code, "message": e.message, "data": e.data }
            }),
        };
        ResponseTemplate::new(200).set_body_json(payload)
    }
}

impl MockLedger {
    /// Upstream chain with the standard fixtures deployed
    pub fn new() -> Self {
        let mut upstream = World {
            block: START_BLOCK,
            ..Default::default()
        };
        upstream.code.insert(REGISTRY, Kind::Registry { owner: REGISTRY_OWNER });
        upstream.code.insert(PROXY_FACTORY, Kind::ProxyFactory);
        upstream.code.insert(
            WRAPPER_REGISTRY,
            Kind::WrapperRegistry {
                owner: WRAPPER_REGISTRY_OWNER,
            },
        );
        upstream.code.insert(AAVE_MARKET, Kind::Generic);
        upstream.code.insert(WETH, Kind::Erc20(SlotLayout::Solidity { slot: 3 }));
        upstream.code.insert(USDC, Kind::Erc20(SlotLayout::Solidity { slot: 9 }));
        upstream.code.insert(CRV, Kind::Erc20(SlotLayout::Vyper { slot: 1 }));
        upstream.code.insert(OPAQUE, Kind::Erc20(SlotLayout::Solidity { slot: 500 }));
        upstream.code.insert(AWETH, Kind::Erc20(SlotLayout::Solidity { slot: 52 }));
        upstream.code.insert(
            PACKED,
            Kind::PackedErc20 {
                layout: SlotLayout::Solidity { slot: 4 },
                bits: PACKED_BALANCE_BITS,
            },
        );
        upstream.code.insert(
            CAPPED,
            Kind::CappedErc20 {
                layout: SlotLayout::Solidity { slot: 2 },
                cap: U256::exp10(18),
            },
        );

        let templates = vec![
            (b"AaveSupply".to_vec(), Kind::SupplyAction { receipt_token: AWETH }),
            (
                b"AaveBorrow".to_vec(),
                Kind::RevertingAction {
                    reason: BORROW_REVERT.to_string(),
                },
            ),
            (b"RecipeExecutor".to_vec(), Kind::RecipeExecutor { registry: REGISTRY }),
            (b"AaveView".to_vec(), Kind::Generic),
            (b"MockExchangeWrapper".to_vec(), Kind::Generic),
        ];

        Self {
            state: Arc::new(Mutex::new(State {
                world: upstream.clone(),
                upstream,
                snapshots: Vec::new(),
                next_snapshot: 0,
                impersonated: HashSet::new(),
                receipts: HashMap::new(),
                transactions: HashMap::new(),
                drop_transactions: false,
                templates,
                calls: Vec::new(),
                pending_polls: 0,
                mine_reverts: false,
                tx_counter: 0,
            })),
        }
    }

    /// Give `holder` a token balance upstream (survives fork resets)
    pub fn seed_token_balance(&self, token: Address, holder: Address, amount: U256) {
        let mut state = self.state.lock().unwrap();
        state.upstream.set_token_balance(token, holder, amount).unwrap();
        state.world.set_token_balance(token, holder, amount).unwrap();
    }

    /// Write a raw storage word upstream (survives fork resets)
    pub fn seed_word(&self, account: Address, key: H256, value: U256) {
        let mut state = self.state.lock().unwrap();
        state.upstream.store(account, key, word_from_u256(value));
        state.world.store(account, key, word_from_u256(value));
    }

    /// Raw storage word of `account` at `key`
    pub fn word_at(&self, account: Address, key: H256) -> U256 {
        self.state.lock().unwrap().world.load_u256(account, key)
    }

    /// Number of requests seen for `method`
    pub fn calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }

    /// Non-zero storage words of `account`
    pub fn storage_of(&self, account: Address) -> HashMap<H256, H256> {
        self.state
            .lock()
            .unwrap()
            .world
            .storage
            .get(&account)
            .cloned()
            .unwrap_or_default()
    }

    /// Token balance as the simulated contract sees it
    pub fn token_balance(&self, token: Address, holder: Address) -> U256 {
        self.state.lock().unwrap().world.token_balance(token, holder).unwrap()
    }

    pub fn native_balance(&self, account: Address) -> U256 {
        self.state.lock().unwrap().world.balance(account)
    }

    pub fn is_impersonated(&self, account: Address) -> bool {
        self.state.lock().unwrap().impersonated.contains(&account)
    }

    pub fn block(&self) -> u64 {
        self.state.lock().unwrap().world.block
    }

    pub fn time_offset(&self) -> u64 {
        self.state.lock().unwrap().world.time_offset
    }

    /// Answer the next `polls` receipt queries with `null`
    pub fn set_pending_polls(&self, polls: u32) {
        self.state.lock().unwrap().pending_polls = polls;
    }

    /// Forget sent transactions, as a node that dropped them would
    pub fn set_drop_transactions(&self, drop: bool) {
        self.state.lock().unwrap().drop_transactions = drop;
    }

    /// Mine reverting transactions with status 0 instead of failing the send
    pub fn set_mine_reverts(&self, mine: bool) {
        self.state.lock().unwrap().mine_reverts = mine;
    }
}

/// Start a mock node serving `ledger`
pub async fn serve(ledger: &MockLedger) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ledger.clone())
        .mount(&server)
        .await;
    server
}

/// Harness configuration pointed at a mock node
pub fn test_config(node_url: String) -> HarnessConfig {
    HarnessConfig::mainnet()
        .with_node_url(node_url)
        .with_fork("https://archive.example", Some(START_BLOCK))
        .with_registry(REGISTRY, REGISTRY_OWNER)
        .with_proxy_registry(PROXY_FACTORY)
        .with_wrapper_registry(WRAPPER_REGISTRY, WRAPPER_REGISTRY_OWNER)
        .with_deployer(DEPLOYER)
        .with_receipt_config(5, 2)
        .with_asset(AssetInfo::new("WETH", WETH, 18).with_balance_slot(SlotLayout::Solidity { slot: 3 }))
        .with_asset(AssetInfo::new("USDC", USDC, 6))
        .with_asset(AssetInfo::new("CRV", CRV, 18))
        .with_asset(AssetInfo::new("aWETH", AWETH, 18))
        .with_price("WETH", "2000")
        .with_price("USDC", "1")
        .with_price("CRV", "0.5")
}

fn empty_abi() -> Abi {
    serde_json::from_str("[]").unwrap()
}

/// Artifacts whose bytecode the mock node recognises
pub fn artifacts() -> InMemoryArtifacts {
    ["AaveSupply", "AaveBorrow", "RecipeExecutor", "AaveView", "MockExchangeWrapper"]
        .into_iter()
        .fold(InMemoryArtifacts::new(), |store, name| {
            store.with_artifact(name, empty_abi(), Bytes::from(name.as_bytes().to_vec()))
        })
}

/// Connect a harness with `config` to `server`
pub async fn connect(config: HarnessConfig) -> ForkHarness {
    fork_harness::init_tracing();
    let prices = StaticPriceTable::new(config.prices.clone());
    ForkHarness::connect(Arc::new(config), Arc::new(artifacts()), Arc::new(prices))
        .await
        .unwrap()
}

/// Mock node plus a harness connected to it
pub async fn setup() -> (MockServer, MockLedger, ForkHarness) {
    let ledger = MockLedger::new();
    let server = serve(&ledger).await;
    let harness = connect(test_config(server.uri())).await;
    (server, ledger, harness)
}
