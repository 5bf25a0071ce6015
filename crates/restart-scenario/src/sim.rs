//! In-process ledger cluster implementing [`NodeSupervisor`].
//!
//! Blocks are produced on a fixed interval of `tokio` time while at least one
//! caught-up producer is running, so tests can drive whole scenarios under a
//! paused clock. The cluster is a cheap handle: clones share state, which
//! lets a test keep one clone for fault knobs while the orchestrator owns
//! another.

use alloy_primitives::{Address, B256, U256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ChainSyncStrategy, ClusterTopology, KillSignal};
use crate::error::SupervisorError;
use crate::ledger::{AccountState, SignedTransfer, Transfer, TxReceipt};
use crate::node::{NodeId, NodeInstance, NodeRole};
use crate::supervisor::{Genesis, NodeDiagnostics, NodeSupervisor, TeardownOptions};

#[derive(Debug, Clone)]
pub struct SimSettings {
    pub block_interval: Duration,
    /// Time a relaunched node needs before it follows the head again.
    /// Doubled for a full resync.
    pub catch_up_delay: Duration,
    /// Effective gas price charged per unit of gas, capped by the transfer's max fee.
    pub gas_price: u128,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(1),
            catch_up_delay: Duration::from_secs(3),
            gas_price: 1_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Process {
    /// Stopped; the node's chain is frozen at `height`.
    Down { height: u64 },
    /// Running. Until `ready_at` the node reports `base_height`; `None` never catches up.
    Up { base_height: u64, ready_at: Option<Instant> },
}

#[derive(Debug)]
struct SimNode {
    role: NodeRole,
    process: Process,
}

#[derive(Debug, Default)]
struct Faults {
    fail_launch: bool,
    fail_relaunch: bool,
    stall_relaunch: bool,
    reject_submissions: u32,
    unreachable: HashSet<NodeId>,
    mute_accounts: HashSet<NodeId>,
    balance_skew: HashMap<NodeId, U256>,
}

/// Calls observed by the cluster, for assertions.
#[derive(Debug, Default, Clone)]
pub struct SimRecord {
    pub prepare_calls: Vec<bool>,
    pub kills: Vec<(NodeId, KillSignal)>,
    pub relaunches: Vec<(NodeId, ChainSyncStrategy)>,
    pub teardowns: Vec<TeardownOptions>,
    pub accepted_transfers: usize,
}

#[derive(Debug)]
struct SimState {
    settings: SimSettings,
    chain_id: u64,
    nodes: Vec<SimNode>,
    /// `snapshots[h]` is the ledger state after block `h`; index 0 is genesis.
    snapshots: Vec<BTreeMap<Address, AccountState>>,
    mempool: Vec<SignedTransfer>,
    receipts: HashMap<B256, TxReceipt>,
    next_block_at: Option<Instant>,
    faults: Faults,
    record: SimRecord,
}

impl SimState {
    fn head(&self) -> u64 {
        self.snapshots.len().saturating_sub(1) as u64
    }

    fn node(&self, id: NodeId) -> Result<&SimNode, SupervisorError> {
        self.nodes.get(id.0).ok_or(SupervisorError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SimNode, SupervisorError> {
        self.nodes.get_mut(id.0).ok_or(SupervisorError::UnknownNode(id))
    }

    fn height_of(&self, node: &SimNode, now: Instant) -> u64 {
        match node.process {
            Process::Down { height } => height,
            Process::Up { ready_at: Some(at), .. } if now >= at => self.head(),
            Process::Up { base_height, .. } => base_height,
        }
    }

    fn producing(&self, now: Instant) -> bool {
        self.nodes.iter().any(|n| {
            n.role == NodeRole::Producer
                && matches!(n.process, Process::Up { ready_at: Some(at), .. } if now >= at)
        })
    }

    /// Produces every block due up to `now`.
    fn advance(&mut self, now: Instant) {
        let interval = self.settings.block_interval;
        while let Some(due) = self.next_block_at {
            if due > now {
                break;
            }
            if self.producing(due) {
                self.produce_block();
            }
            self.next_block_at = Some(due + interval);
        }
    }

    fn produce_block(&mut self) {
        let height = self.head() + 1;
        let mut state = self.snapshots.last().cloned().unwrap_or_default();
        for tx in std::mem::take(&mut self.mempool) {
            let t = &tx.transfer;
            let price = self.settings.gas_price.min(t.max_fee_per_gas);
            let fee = U256::from(t.gas_limit) * U256::from(price);

            let sender = state.entry(t.from).or_default();
            sender.balance -= t.value + fee;
            sender.nonce += 1;
            state.entry(t.to).or_default().balance += t.value;

            self.receipts.insert(tx.hash, TxReceipt { hash: tx.hash, block_height: height, success: true, fee });
        }
        self.snapshots.push(state);
    }

    fn ensure_reachable(&self, id: NodeId) -> Result<&SimNode, SupervisorError> {
        let node = self.node(id)?;
        if matches!(node.process, Process::Down { .. }) {
            return Err(SupervisorError::NotRunning(id));
        }
        if self.faults.unreachable.contains(&id) {
            return Err(SupervisorError::Rpc { node: id, message: "connection refused".into() });
        }
        Ok(node)
    }

    fn pending_from(&self, address: Address) -> impl Iterator<Item = &SignedTransfer> {
        self.mempool.iter().filter(move |tx| tx.transfer.from == address)
    }

    fn validate(&self, id: NodeId, tx: &SignedTransfer) -> Result<(), String> {
        let t = &tx.transfer;
        if !tx.verify() {
            return Err("invalid signature".into());
        }
        if t.chain_id != self.chain_id {
            return Err(format!("invalid chain id {}", t.chain_id));
        }
        if self.mempool.iter().any(|p| p.hash == tx.hash) || self.receipts.contains_key(&tx.hash) {
            return Err("already known".into());
        }

        let head = self.snapshots.last().and_then(|s| s.get(&t.from)).copied().unwrap_or_default();
        let pending: Vec<_> = self.pending_from(t.from).collect();
        let expected_nonce = head.nonce + pending.len() as u64;
        if t.nonce < expected_nonce {
            return Err(format!("nonce too low: next nonce {expected_nonce}, tx nonce {}", t.nonce));
        }
        if t.nonce > expected_nonce {
            return Err(format!("nonce too high: next nonce {expected_nonce}, tx nonce {}", t.nonce));
        }

        let max_cost = |x: &Transfer| x.value + U256::from(x.gas_limit) * U256::from(x.max_fee_per_gas);
        let committed: U256 = pending.iter().map(|p| max_cost(&p.transfer)).fold(U256::ZERO, |a, b| a + b);
        if head.balance < committed + max_cost(t) {
            return Err(format!("insufficient funds on {id}: balance {}", head.balance));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimulatedCluster {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new(SimSettings::default())
    }
}

impl SimulatedCluster {
    pub fn new(settings: SimSettings) -> Self {
        let state = SimState {
            settings,
            chain_id: 0,
            nodes: Vec::new(),
            snapshots: Vec::new(),
            mempool: Vec::new(),
            receipts: HashMap::new(),
            next_block_at: None,
            faults: Faults::default(),
            record: SimRecord::default(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.advance(Instant::now());
        state
    }

    /// The next `launch` fails before starting any node.
    pub fn fail_launch(&self) {
        self.lock().faults.fail_launch = true;
    }

    /// Every subsequent `relaunch` fails to start the process.
    pub fn fail_relaunches(&self) {
        self.lock().faults.fail_relaunch = true;
    }

    /// Relaunched nodes come back up but never catch up with the head.
    pub fn stall_relaunches(&self) {
        self.lock().faults.stall_relaunch = true;
    }

    /// Rejects the next `count` submissions as if the pool were full.
    pub fn reject_next_submissions(&self, count: u32) {
        self.lock().faults.reject_submissions = count;
    }

    /// Makes `node` report every non-zero balance `skew` higher than the
    /// ledger holds. May be set before launch.
    pub fn diverge(&self, node: NodeId, skew: U256) {
        self.lock().faults.balance_skew.insert(node, skew);
    }

    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.faults.unreachable.insert(node);
        } else {
            state.faults.unreachable.remove(&node);
        }
    }

    /// Makes `node` fail account queries while still reporting its height.
    pub fn mute_account_queries(&self, node: NodeId) {
        self.lock().faults.mute_accounts.insert(node);
    }

    pub fn record(&self) -> SimRecord {
        self.lock().record.clone()
    }

    pub fn head_height(&self) -> u64 {
        self.lock().head()
    }
}

#[async_trait::async_trait]
impl NodeSupervisor for SimulatedCluster {
    async fn prepare(&mut self, all_instances: bool) -> Result<(), SupervisorError> {
        self.lock().record.prepare_calls.push(all_instances);
        Ok(())
    }

    async fn launch(
        &mut self,
        topology: &ClusterTopology,
        genesis: &Genesis,
    ) -> Result<Vec<NodeInstance>, SupervisorError> {
        {
            let mut state = self.lock();
            if state.faults.fail_launch {
                return Err(SupervisorError::Spawn { node: NodeId(0), reason: "simulated launch failure".into() });
            }
            state.chain_id = genesis.chain_id;
            let alloc = genesis
                .alloc
                .iter()
                .map(|(address, balance)| (*address, AccountState { balance: *balance, nonce: 0 }))
                .collect();
            state.snapshots = vec![alloc];
            state.next_block_at = Some(Instant::now() + state.settings.block_interval);
        }

        let mut instances = Vec::with_capacity(topology.total_nodes);
        for i in 0..topology.total_nodes {
            if i > 0 && !topology.launch_delay.is_zero() {
                tokio::time::sleep(topology.launch_delay).await;
            }
            let role = if i < topology.producing_nodes { NodeRole::Producer } else { NodeRole::NonProducer };
            let mut state = self.lock();
            let head = state.head();
            state.nodes.push(SimNode {
                role,
                process: Process::Up { base_height: head, ready_at: Some(Instant::now()) },
            });
            debug!(node = %NodeId(i), ?role, "simulated node started");
            instances.push(NodeInstance::new(NodeId(i), role));
        }

        info!(nodes = instances.len(), "simulated cluster launched");
        Ok(instances)
    }

    async fn kill(&mut self, node: NodeId, signal: KillSignal) -> Result<(), SupervisorError> {
        let mut state = self.lock();
        let now = Instant::now();
        let height = {
            let n = state.node(node)?;
            if matches!(n.process, Process::Down { .. }) {
                return Err(SupervisorError::NotRunning(node));
            }
            state.height_of(n, now)
        };
        state.node_mut(node)?.process = Process::Down { height };
        state.record.kills.push((node, signal));
        debug!(%node, %signal, height, "simulated node stopped");
        Ok(())
    }

    async fn relaunch(
        &mut self,
        node: NodeId,
        strategy: ChainSyncStrategy,
    ) -> Result<(), SupervisorError> {
        let mut state = self.lock();
        let Process::Down { height } = state.node(node)?.process else {
            return Err(SupervisorError::Spawn { node, reason: "already running".into() });
        };
        if state.faults.fail_relaunch {
            return Err(SupervisorError::Spawn { node, reason: "simulated relaunch failure".into() });
        }

        let delay = state.settings.catch_up_delay;
        let (base_height, delay) = match strategy {
            ChainSyncStrategy::Resync => (0, delay * 2),
            ChainSyncStrategy::Replay | ChainSyncStrategy::None => (height, delay),
        };
        let ready_at = (!state.faults.stall_relaunch).then(|| Instant::now() + delay);
        state.node_mut(node)?.process = Process::Up { base_height, ready_at };
        state.record.relaunches.push((node, strategy));
        debug!(%node, %strategy, base_height, "simulated node relaunched");
        Ok(())
    }

    async fn query_height(&self, node: NodeId) -> Result<u64, SupervisorError> {
        let state = self.lock();
        let n = state.ensure_reachable(node)?;
        Ok(state.height_of(n, Instant::now()))
    }

    async fn query_account(
        &self,
        node: NodeId,
        address: Address,
    ) -> Result<AccountState, SupervisorError> {
        let state = self.lock();
        let n = state.ensure_reachable(node)?;
        if state.faults.mute_accounts.contains(&node) {
            return Err(SupervisorError::Rpc { node, message: "request timed out".into() });
        }
        let height = state.height_of(n, Instant::now()) as usize;
        let mut account = state
            .snapshots
            .get(height)
            .and_then(|s| s.get(&address))
            .copied()
            .unwrap_or_default();
        account.nonce += state.pending_from(address).count() as u64;
        if let Some(skew) = state.faults.balance_skew.get(&node) {
            if !account.balance.is_zero() {
                account.balance += *skew;
            }
        }
        Ok(account)
    }

    async fn submit(&self, node: NodeId, tx: &SignedTransfer) -> Result<B256, SupervisorError> {
        let mut state = self.lock();
        state.ensure_reachable(node)?;
        if state.faults.reject_submissions > 0 {
            state.faults.reject_submissions -= 1;
            return Err(SupervisorError::Rejected { node, reason: "transaction pool is full".into() });
        }
        state.validate(node, tx).map_err(|reason| SupervisorError::Rejected { node, reason })?;

        state.mempool.push(tx.clone());
        state.record.accepted_transfers += 1;
        Ok(tx.hash)
    }

    async fn receipt(&self, node: NodeId, hash: B256) -> Result<Option<TxReceipt>, SupervisorError> {
        let state = self.lock();
        let n = state.ensure_reachable(node)?;
        let height = state.height_of(n, Instant::now());
        Ok(state.receipts.get(&hash).filter(|r| r.block_height <= height).copied())
    }

    async fn shutdown(&mut self, options: TeardownOptions) -> Result<(), SupervisorError> {
        let mut state = self.lock();
        state.record.teardowns.push(options);
        if options.stop_nodes {
            let now = Instant::now();
            let heights: Vec<u64> = state.nodes.iter().map(|n| state.height_of(n, now)).collect();
            for (node, height) in state.nodes.iter_mut().zip(heights) {
                node.process = Process::Down { height };
            }
        }
        Ok(())
    }

    fn diagnostics(&self) -> Vec<NodeDiagnostics> {
        let state = self.lock();
        let now = Instant::now();
        state
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let running = matches!(n.process, Process::Up { .. });
                NodeDiagnostics {
                    node: NodeId(i),
                    config: serde_json::json!({
                        "node": NodeId(i),
                        "role": n.role,
                        "running": running,
                        "height": state.height_of(n, now),
                    })
                    .to_string(),
                    stderr_tail: String::new(),
                }
            })
            .collect()
    }
}
