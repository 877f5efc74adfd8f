//! Error types for the fork harness.
//!
//! Errors fall into two families: setup faults, raised when a precondition
//! (fork pin, registry entry, storage layout, price) cannot be established, and
//! action faults, raised when a proxy-executed action reverts on the ledger.
//! Neither family is ever retried.

use ethers::providers::{ProviderError, RpcError};
use ethers::types::Address;
use thiserror::Error;

/// Errors raised by the balance forger's direct storage writes.
///
/// Kept apart from [`HarnessError`] so a forged balance can never be mistaken
/// for the outcome of a real transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageInjectionError {
    /// No candidate slot round-tripped a sentinel through `balanceOf`
    #[error("Unsupported token layout for {token:?}: no balance slot found in {probed} candidate slots")]
    UnsupportedTokenLayout {
        /// Token contract that was probed
        token: Address,
        /// Number of slot indices tried
        probed: u64,
    },

    /// The write landed but `balanceOf` reports a different value
    #[error("Balance read-back mismatch for {holder:?} on {token:?}: wrote {expected}, read {actual}")]
    ReadBackMismatch {
        /// Token contract
        token: Address,
        /// Holder whose balance was forged
        holder: Address,
        /// Amount written
        expected: String,
        /// Amount observed afterwards
        actual: String,
    },

    /// The balance shares its storage word with fields a write would clobber
    #[error("Balance of {holder:?} on {token:?} is packed in storage word {slot} with other state that a write would corrupt")]
    PackedLayout {
        /// Token contract
        token: Address,
        /// Holder whose balance was forged
        holder: Address,
        /// Slot key in hex
        slot: String,
    },

    /// A trial write could not be undone
    #[error("Storage word at {slot} of {token:?} was not restored after a trial write")]
    RestoreFailed {
        /// Token contract
        token: Address,
        /// Slot key in hex
        slot: String,
    },
}

/// Main error type for harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The fork could not be pinned to the requested block
    #[error("Fork pin to block {block} failed: {reason}")]
    ForkPinFailed {
        /// Requested block height
        block: u64,
        /// Upstream explanation
        reason: String,
    },

    /// No address is registered under this logical name
    #[error("Contract not registered: {0}")]
    NotRegistered(String),

    /// Direct storage manipulation failed
    #[error("Storage injection failed: {0}")]
    StorageInjection(#[from] StorageInjectionError),

    /// No usable price for a token symbol
    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable {
        /// Token symbol
        symbol: String,
        /// Why the lookup failed
        reason: String,
    },

    /// Token symbol or address missing from the asset book
    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    /// Snapshot belongs to a discarded state line or was invalidated by an outer revert
    #[error("Stale snapshot token {0}")]
    StaleSnapshot(String),

    /// The node refused to revert to the snapshot
    #[error("Node rejected revert to snapshot {0}")]
    SnapshotRejected(String),

    /// Impersonation session predates the current fork pin
    #[error("Impersonation session for {0:?} is stale; re-impersonate after a fork reset")]
    StaleSession(Address),

    /// No compiled artifact for this contract name
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// More than one build artifact matches a contract name
    #[error("Artifact {name} is ambiguous: {paths:?}")]
    AmbiguousArtifact {
        /// Contract name
        name: String,
        /// Matching artifact files
        paths: Vec<String>,
    },

    /// Deployment transaction did not produce a contract
    #[error("Deployment of {name} failed: {reason}")]
    DeploymentFailed {
        /// Contract name
        name: String,
        /// Failure detail
        reason: String,
    },

    /// A proxy-executed action reverted
    #[error("Action {action} reverted: {reason}")]
    ActionReverted {
        /// Action or recipe name
        action: String,
        /// Revert reason as reported by the ledger
        reason: String,
    },

    /// Action parameters failed shape validation before dispatch
    #[error("Invalid action {action}: {reason}")]
    InvalidAction {
        /// Action name
        action: String,
        /// Validation failure
        reason: String,
    },

    /// Amount could not be parsed or is out of range
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// JSON-RPC error object returned by the node
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional error payload (revert data)
        data: Option<serde_json::Value>,
    },

    /// Network communication error
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Provider failure that carried no JSON-RPC error object
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// ABI encoding or decoding error
    #[error("ABI error: {0}")]
    Abi(#[from] ethers::abi::Error),

    /// Invalid response from the node
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Transaction receipt did not appear in time
    #[error("Transaction {hash} not mined after {secs} seconds")]
    TransactionTimeout {
        /// Transaction hash
        hash: String,
        /// Timeout that elapsed
        secs: u64,
    },

    /// The node no longer knows a sent transaction
    #[error("Transaction {0} was dropped by the node")]
    TransactionDropped(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    /// Filesystem error while reading artifacts or config
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProviderError> for HarnessError {
    fn from(err: ProviderError) -> Self {
        if let Some(response) = err.as_error_response() {
            return HarnessError::Rpc {
                code: response.code,
                message: response.message.clone(),
                data: response.data.clone(),
            };
        }
        match err {
            ProviderError::HTTPError(e) => HarnessError::NetworkError(e),
            ProviderError::SerdeJson(e) => HarnessError::SerializationError(e),
            other => HarnessError::Provider(other),
        }
    }
}

impl HarnessError {
    /// Whether this error means a test precondition could not be staged
    pub fn is_setup_fault(&self) -> bool {
        matches!(
            self,
            HarnessError::ForkPinFailed { .. }
                | HarnessError::NotRegistered(_)
                | HarnessError::StorageInjection(_)
                | HarnessError::PriceUnavailable { .. }
                | HarnessError::UnknownAsset(_)
                | HarnessError::StaleSnapshot(_)
                | HarnessError::SnapshotRejected(_)
                | HarnessError::StaleSession(_)
                | HarnessError::ArtifactNotFound(_)
                | HarnessError::AmbiguousArtifact { .. }
                | HarnessError::DeploymentFailed { .. }
        )
    }

    /// Whether this error is a revert from the behavior under test
    pub fn is_action_fault(&self) -> bool {
        matches!(self, HarnessError::ActionReverted { .. })
    }

    /// Revert reason, if this is an action fault
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            HarnessError::ActionReverted { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
