//! Kill/relaunch fault-tolerance scenario for replicated ledger clusters.
//!
//! A [`Scenario`] launches a cluster through a [`NodeSupervisor`], waits for
//! block production, provisions accounts, validates a transfer workload, kills
//! a subset of nodes, validates again on the survivors, relaunches the killed
//! nodes and validates once more after they resync.

pub mod accounts;
pub mod config;
pub mod error;
pub mod fault_injector;
pub mod fund_spread;
pub mod ledger;
pub mod node;
pub mod orchestrator;
pub mod sim;
pub mod supervisor;
pub mod sync_barrier;
pub mod topology;
pub mod wallet;

pub use config::{
    ChainSyncStrategy, ClusterTopology, KillSignal, LedgerSettings, P2pPlugin, RetrySettings,
    ScenarioConfig, SyncSettings, TopologyShape,
};
pub use error::{ConsistencyFailure, ScenarioError, ScenarioResult, SupervisorError, WalletError};
pub use node::{NodeId, NodeInstance, NodeRole, NodeSet, NodeState};
pub use orchestrator::{Scenario, ScenarioReport, ScenarioState};
pub use sim::{SimSettings, SimulatedCluster};
pub use supervisor::{NodeSupervisor, ProcessSupervisor, ProcessSupervisorConfig};
pub use wallet::{KeystoreWallet, WalletService};
