//! Name registry resolution and contract (re)deployment.
//!
//! Contracts that depend on an action find it through the on-chain registry by
//! logical name. Redeploying a name always creates a fresh instance and, when
//! asked, overwrites the registry entry so every by-name caller picks up the
//! new code.

use crate::actions::revert_reason;
use crate::artifacts::ArtifactSource;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::impersonate::Impersonator;
use crate::receipt::ReceiptWatcher;
use crate::rpc::NodeRpcClient;
use crate::types::{RegistryId, TxReceipt, TxRequest};
use ethers::abi::{self, Abi, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;
use std::sync::Arc;
use tracing::{debug, info};

/// A freshly deployed contract
#[derive(Debug, Clone)]
pub struct ContractHandle {
    /// Logical name
    pub name: String,
    /// Deployed address
    pub address: Address,
    /// Calling interface
    pub abi: Abi,
}

impl ContractHandle {
    /// ABI-encode a call to `function` on this contract
    pub fn encode_call(&self, function: &str, args: &[Token]) -> Result<Bytes> {
        let function = self.abi.function(function)?;
        Ok(Bytes::from(function.encode_input(args)?))
    }

    /// Read `function` with `eth_call` and decode its return values
    pub async fn call(
        &self,
        rpc: &NodeRpcClient,
        from: Address,
        function: &str,
        args: &[Token],
    ) -> Result<Vec<Token>> {
        let data = self.encode_call(function, args)?;
        let output = rpc
            .eth_call(&TxRequest::call(from, self.address, data))
            .await
            .map_err(|e| self.reverted(function, e))?;
        Ok(self.abi.function(function)?.decode_output(&output)?)
    }

    /// Send `function` from `from` and wait for it to be mined.
    ///
    /// The sender must already be unlocked or impersonated. Reverts, whether
    /// reported on send or by a failed receipt, are `ActionReverted`.
    pub async fn send(
        &self,
        rpc: &NodeRpcClient,
        watcher: &ReceiptWatcher,
        from: Address,
        function: &str,
        args: &[Token],
        gas_limit: u64,
    ) -> Result<TxReceipt> {
        let data = self.encode_call(function, args)?;
        let tx = TxRequest::call(from, self.address, data).with_gas(gas_limit);

        let hash = rpc
            .send_transaction(&tx)
            .await
            .map_err(|e| self.reverted(function, e))?;
        let receipt = watcher.wait(hash).await?;
        if !receipt.succeeded() {
            return Err(HarnessError::ActionReverted {
                action: format!("{}.{}", self.name, function),
                reason: format!("transaction {:?} reverted", hash),
            });
        }

        debug!("{}.{} mined in {:?}", self.name, function, hash);
        Ok(receipt)
    }

    fn reverted(&self, function: &str, error: HarnessError) -> HarnessError {
        match revert_reason(&error) {
            Some(reason) => HarnessError::ActionReverted {
                action: format!("{}.{}", self.name, function),
                reason,
            },
            None => error,
        }
    }
}

/// Build calldata for `signature` with ABI-encoded `args`
pub(crate) fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

/// Decode a single address return value
pub(crate) fn decode_address(output: &[u8]) -> Result<Address> {
    abi::decode(&[ParamType::Address], output)?
        .into_iter()
        .next()
        .and_then(Token::into_address)
        .ok_or_else(|| HarnessError::InvalidResponse("expected an address".to_string()))
}

/// Resolves names through the registry and deploys contracts
pub struct RegistryResolver {
    rpc: NodeRpcClient,
    watcher: ReceiptWatcher,
    artifacts: Arc<dyn ArtifactSource>,
    registry: Address,
    owner: Address,
    deployer: Address,
    gas_limit: u64,
    top_up_wei: U256,
}

impl RegistryResolver {
    /// Create a resolver for the configured registry
    pub fn new(
        rpc: NodeRpcClient,
        watcher: ReceiptWatcher,
        artifacts: Arc<dyn ArtifactSource>,
        config: &HarnessConfig,
    ) -> Self {
        Self {
            rpc,
            watcher,
            artifacts,
            registry: config.registry_address,
            owner: config.registry_owner,
            deployer: config.deployer,
            gas_limit: config.gas_limit,
            top_up_wei: config.top_up_wei,
        }
    }

    /// Configured registry contract
    pub fn registry_address(&self) -> Address {
        self.registry
    }

    /// Account that sends deployments
    pub fn deployer(&self) -> Address {
        self.deployer
    }

    /// Address registered under `name`; a zero entry is `NotRegistered`
    pub async fn get_addr_from_registry(&self, name: &str) -> Result<Address> {
        self.resolve_in(self.registry, name).await
    }

    async fn resolve_in(&self, registry: Address, name: &str) -> Result<Address> {
        let id = RegistryId::from_name(name);
        let data = calldata("resolve(bytes4)", &[Token::FixedBytes(id.0.to_vec())]);
        let output = self
            .rpc
            .eth_call(&TxRequest::call(self.deployer, registry, data))
            .await?;

        let address = decode_address(&output)?;
        if address.is_zero() {
            return Err(HarnessError::NotRegistered(name.to_string()));
        }

        debug!("Resolved {} ({}) to {:?}", name, id, address);
        Ok(address)
    }

    /// Deploy `name` afresh, optionally registering it in `registry`
    pub async fn redeploy(
        &self,
        impersonator: &mut Impersonator,
        name: &str,
        registry: Address,
        should_register: bool,
        is_fork: bool,
    ) -> Result<ContractHandle> {
        self.redeploy_with_args(impersonator, name, registry, should_register, is_fork, &[])
            .await
    }

    /// Like [`redeploy`](Self::redeploy) with constructor arguments
    pub async fn redeploy_with_args(
        &self,
        impersonator: &mut Impersonator,
        name: &str,
        registry: Address,
        should_register: bool,
        is_fork: bool,
        args: &[Token],
    ) -> Result<ContractHandle> {
        let artifact = self.artifacts.artifact(name)?;

        let mut init_code = artifact.bytecode.to_vec();
        if !args.is_empty() {
            init_code.extend(abi::encode(args));
        }

        self.prepare_sender(impersonator, self.deployer, is_fork)
            .await?;

        let tx = TxRequest::deploy(self.deployer, init_code).with_gas(self.gas_limit);
        let receipt = self.send(name, &tx).await?;

        let address = receipt
            .contract_address
            .ok_or_else(|| HarnessError::DeploymentFailed {
                name: name.to_string(),
                reason: "receipt carries no contract address".to_string(),
            })?;

        info!("Deployed {} at {:?}", name, address);

        if should_register {
            self.register(impersonator, registry, name, address, is_fork)
                .await?;
        }

        Ok(ContractHandle {
            name: name.to_string(),
            address,
            abi: artifact.abi,
        })
    }

    /// Point `name` at `address` in `registry`, overwriting any prior entry
    pub async fn register(
        &self,
        impersonator: &mut Impersonator,
        registry: Address,
        name: &str,
        address: Address,
        is_fork: bool,
    ) -> Result<()> {
        let owner = self.owner_of(registry).await?;
        self.prepare_sender(impersonator, owner, is_fork).await?;

        let id = RegistryId::from_name(name);
        let data = calldata(
            "register(bytes4,address)",
            &[Token::FixedBytes(id.0.to_vec()), Token::Address(address)],
        );
        let tx = TxRequest::call(owner, registry, data).with_gas(self.gas_limit);
        self.send(name, &tx).await?;

        info!("Registered {} ({}) -> {:?}", name, id, address);
        Ok(())
    }

    /// Configured owner for the configured registry, otherwise `owner()`
    async fn owner_of(&self, registry: Address) -> Result<Address> {
        if registry == self.registry && !self.owner.is_zero() {
            return Ok(self.owner);
        }
        let output = self
            .rpc
            .eth_call(&TxRequest::call(
                self.deployer,
                registry,
                calldata("owner()", &[]),
            ))
            .await?;
        decode_address(&output)
    }

    /// Impersonate `account` and, on a fork, fund it for gas
    async fn prepare_sender(
        &self,
        impersonator: &mut Impersonator,
        account: Address,
        is_fork: bool,
    ) -> Result<()> {
        impersonator.impersonate(account).await?;
        if is_fork {
            self.rpc.set_balance(account, self.top_up_wei).await?;
            debug!("Topped up {:?} with {} wei", account, self.top_up_wei);
        }
        Ok(())
    }

    /// Send a setup transaction; node errors and reverts are `DeploymentFailed`
    async fn send(&self, name: &str, tx: &TxRequest) -> Result<TxReceipt> {
        let failed = |reason: String| HarnessError::DeploymentFailed {
            name: name.to_string(),
            reason,
        };

        let hash = self.rpc.send_transaction(tx).await.map_err(|e| match e {
            HarnessError::Rpc { message, .. } => failed(message),
            other => other,
        })?;
        let receipt = self.watcher.wait(hash).await?;
        if !receipt.succeeded() {
            return Err(failed(format!("transaction {:?} reverted", hash)));
        }
        Ok(receipt)
    }
}
