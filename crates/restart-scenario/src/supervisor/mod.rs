//! Capability interface over the node processes of a cluster.
//!
//! The orchestrator never touches processes directly; it drives a
//! [`NodeSupervisor`], which is either a [`ProcessSupervisor`] managing real
//! node binaries or the in-process [`SimulatedCluster`](crate::sim::SimulatedCluster).

pub mod genesis;
pub mod process;
pub mod rpc_client;

use alloy_primitives::{Address, B256, U256};
use std::collections::BTreeMap;

use crate::config::{ChainSyncStrategy, ClusterTopology, KillSignal};
use crate::error::SupervisorError;
use crate::ledger::{AccountState, SignedTransfer, TxReceipt};
use crate::node::{NodeId, NodeInstance};

pub use process::{ProcessSupervisor, ProcessSupervisorConfig};

/// Initial chain state handed to the supervisor at launch.
#[derive(Debug, Clone)]
pub struct Genesis {
    pub chain_id: u64,
    pub alloc: BTreeMap<Address, U256>,
}

/// What teardown should do with the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownOptions {
    /// Stop our node processes. False when the operator asked to leave the
    /// cluster running after a successful run.
    pub stop_nodes: bool,
    /// Also kill unrelated node instances on this host.
    pub all_instances: bool,
    /// Remove per-node configuration, data and logs.
    pub remove_state: bool,
}

/// Postmortem material for one node.
#[derive(Debug, Clone)]
pub struct NodeDiagnostics {
    pub node: NodeId,
    pub config: String,
    pub stderr_tail: String,
}

#[async_trait::async_trait]
pub trait NodeSupervisor: Send + Sync {
    /// Kills leftover instances (all of them when `all_instances`) and removes
    /// state left behind by earlier runs.
    async fn prepare(&mut self, all_instances: bool) -> Result<(), SupervisorError>;

    /// Starts every node of `topology`, waiting `launch_delay` between nodes.
    async fn launch(
        &mut self,
        topology: &ClusterTopology,
        genesis: &Genesis,
    ) -> Result<Vec<NodeInstance>, SupervisorError>;

    async fn kill(&mut self, node: NodeId, signal: KillSignal) -> Result<(), SupervisorError>;

    /// Restarts a previously killed node, recovering its chain per `strategy`.
    async fn relaunch(
        &mut self,
        node: NodeId,
        strategy: ChainSyncStrategy,
    ) -> Result<(), SupervisorError>;

    async fn query_height(&self, node: NodeId) -> Result<u64, SupervisorError>;

    /// Balance and pending nonce of `address` on `node`.
    async fn query_account(
        &self,
        node: NodeId,
        address: Address,
    ) -> Result<AccountState, SupervisorError>;

    async fn submit(&self, node: NodeId, tx: &SignedTransfer) -> Result<B256, SupervisorError>;

    /// `None` until `node` has applied the block including `hash`.
    async fn receipt(&self, node: NodeId, hash: B256) -> Result<Option<TxReceipt>, SupervisorError>;

    async fn shutdown(&mut self, options: TeardownOptions) -> Result<(), SupervisorError>;

    fn diagnostics(&self) -> Vec<NodeDiagnostics>;
}
