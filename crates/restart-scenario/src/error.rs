use alloy_primitives::{Address, B256, U256};

use crate::node::NodeId;
use crate::orchestrator::ScenarioState;

/// Errors reported by a [`NodeSupervisor`](crate::supervisor::NodeSupervisor).
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The node process could not be started.
    #[error("failed to spawn {node}: {reason}")]
    Spawn { node: NodeId, reason: String },

    /// The operation needs a running process but the node is stopped.
    #[error("{0} is not running")]
    NotRunning(NodeId),

    /// The node index is not part of the launched cluster.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The node's RPC endpoint did not answer or answered garbage.
    #[error("rpc error on {node}: {message}")]
    Rpc { node: NodeId, message: String },

    /// The ledger refused a submitted transaction.
    #[error("transaction rejected by {node}: {reason}")]
    Rejected { node: NodeId, reason: String },

    /// Signal delivery to the node process failed.
    #[error("failed to signal {node}: {reason}")]
    Signal { node: NodeId, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Whether retrying the same call against the same or another node may
    /// succeed. Ledger rejections are not transient at this level; callers that
    /// can repair a rejection (e.g. by re-reading the nonce) decide themselves.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc { .. } | Self::NotRunning(_))
    }
}

/// Errors reported by a [`WalletService`](crate::wallet::WalletService).
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet has not been created")]
    NotCreated,

    #[error("wallet {0} already open")]
    AlreadyOpen(String),

    /// A transaction referenced an account whose key was never imported.
    #[error("no key imported for {0}")]
    KeyNotImported(Address),

    #[error("invalid key for account {account}: {reason}")]
    InvalidKey { account: String, reason: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the fund-spread validator declared the cluster inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyFailure {
    /// One node's balance disagrees with the majority of live nodes.
    #[error("{node} reports {observed} for {account}, majority has {majority}")]
    NodeDiverged {
        node: NodeId,
        account: String,
        majority: U256,
        observed: U256,
    },

    /// The nodes agree with each other but not with the transfer arithmetic.
    #[error("{account} holds {observed}, expected {expected}")]
    UnexpectedBalance {
        account: String,
        expected: U256,
        observed: U256,
    },

    /// Value was created or destroyed by the transfer workload.
    #[error("supply not conserved: before={before} after={after} fees={fees}")]
    SupplyNotConserved { before: U256, after: U256, fees: U256 },

    /// A running node never answered the balance query.
    #[error("{node} did not answer balance queries after {attempts} attempts")]
    NodeUnresponsive { node: NodeId, attempts: u32 },

    /// No live node answered the balance query.
    #[error("no live node answered the balance query")]
    NoAnswers,
}

/// Classified scenario failure. Every variant aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cluster failed to launch: {0}")]
    Launch(#[source] SupervisorError),

    #[error("no block production observed: height {height} not reached within {timeout_secs}s")]
    StabilizationTimeout { height: u64, timeout_secs: u64 },

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("failed to create account {account}: {reason}")]
    AccountCreation { account: String, reason: String },

    #[error("cannot kill {requested} nodes, only {available} can be stopped")]
    InsufficientNodes { requested: usize, available: usize },

    #[error("failed to kill {node}: {source}")]
    Kill {
        node: NodeId,
        #[source]
        source: SupervisorError,
    },

    #[error("cluster did not converge within {timeout_secs}s (heights: {heights})")]
    SyncTimeout { timeout_secs: u64, heights: String },

    #[error("every live node unreachable for {polls} consecutive polls")]
    NodesUnreachable { polls: u32 },

    #[error("ledger divergence: {0}")]
    Consistency(#[from] ConsistencyFailure),

    #[error("transfer {hash} failed: {reason}")]
    Transfer { hash: B256, reason: String },

    #[error("failed to relaunch {node}: {source}")]
    Relaunch {
        node: NodeId,
        #[source]
        source: SupervisorError,
    },

    #[error("scenario cancelled by signal")]
    Cancelled,

    /// `run` was called on a scenario that already finished.
    #[error("scenario already finished in state {0}")]
    AlreadyFinished(ScenarioState),
}

pub type ScenarioResult<T> = Result<T, ScenarioError>;
