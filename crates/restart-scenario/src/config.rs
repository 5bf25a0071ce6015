//! Immutable scenario configuration.
//!
//! The binary parses flags into a [`ScenarioConfig`] once; the orchestrator and
//! its components only ever read it.

use alloy_primitives::U256;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ScenarioError;

/// Default chain id written into genesis and signed into every transfer.
pub const DEFAULT_CHAIN_ID: u64 = 4242;

/// Shape of the peer graph wired between nodes at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyShape {
    /// Every node peers with every other node.
    Mesh,
    Ring,
    /// Node 0 is the hub.
    Star,
    Line,
    /// Two meshes joined by a single link.
    Bridge,
}

/// How a relaunched node recovers its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSyncStrategy {
    /// Keep the data directory and replay the local block log.
    Replay,
    /// Wipe the data directory and fetch every block from peers.
    Resync,
    /// Restart as-is.
    None,
}

/// Signal delivered to nodes selected for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSignal {
    Term,
    Kill,
}

impl KillSignal {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Peer-to-peer transport plugin variant passed to each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum P2pPlugin {
    Net,
    Bnet,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} '{other}', expected one of: {}",
                        stringify!($ty),
                        [$($name),+].join(", ")
                    )),
                }
            }
        }
    };
}

string_enum!(TopologyShape {
    Mesh => "mesh",
    Ring => "ring",
    Star => "star",
    Line => "line",
    Bridge => "bridge",
});
string_enum!(ChainSyncStrategy { Replay => "replay", Resync => "resync", None => "none" });
string_enum!(KillSignal { Term => "term", Kill => "kill" });
string_enum!(P2pPlugin { Net => "net", Bnet => "bnet" });

/// Cluster layout. Fixed once the cluster is launched.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterTopology {
    pub total_nodes: usize,
    /// The first `producing_nodes` ordinals are producers.
    pub producing_nodes: usize,
    pub launch_delay: Duration,
    pub shape: TopologyShape,
    pub chain_sync: ChainSyncStrategy,
    pub p2p_plugin: P2pPlugin,
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self {
            total_nodes: 2,
            producing_nodes: 2,
            launch_delay: Duration::from_secs(1),
            shape: TopologyShape::Mesh,
            chain_sync: ChainSyncStrategy::None,
            p2p_plugin: P2pPlugin::Net,
        }
    }
}

/// Polling and timeout parameters for the sync barrier.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    /// Upper bound for a single height/balance query against one node.
    pub query_timeout: Duration,
    /// Allowed distance between a live node and the highest live node.
    pub height_delta: u64,
    pub sync_timeout: Duration,
    /// Height every node must reach before the cluster counts as producing.
    pub stabilization_height: u64,
    pub stabilization_timeout: Duration,
    /// Consecutive polls with every live node unreachable before giving up.
    pub max_unreachable_polls: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            query_timeout: Duration::from_secs(5),
            height_delta: 2,
            sync_timeout: Duration::from_secs(120),
            stabilization_height: 3,
            stabilization_timeout: Duration::from_secs(60),
            max_unreachable_polls: 25,
        }
    }
}

/// Retry budgets for the transient failures components absorb themselves.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Attempts to confirm a freshly created account is visible.
    pub account_confirm_attempts: u32,
    /// Attempts to get a single transfer accepted by the ledger.
    pub submit_attempts: u32,
    pub retry_interval: Duration,
    /// How long to wait for a submitted transfer to be included.
    pub inclusion_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            account_confirm_attempts: 30,
            submit_attempts: 5,
            retry_interval: Duration::from_millis(500),
            inclusion_timeout: Duration::from_secs(30),
        }
    }
}

/// Ledger parameters signed into every transfer.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub chain_id: u64,
    /// Balance granted to the creator account in genesis.
    pub creator_balance: U256,
    /// Amount transferred from the creator to each new participant.
    pub account_stake: U256,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl LedgerSettings {
    /// The most a single transfer can cost in fees.
    pub fn max_fee(&self) -> U256 {
        U256::from(self.gas_limit) * U256::from(self.max_fee_per_gas)
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        let ether = U256::from(10u64).pow(U256::from(18u64));
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            creator_balance: U256::from(100_000_000u64) * ether,
            account_stake: U256::from(1_000u64) * ether,
            gas_limit: 21_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 100_000_000,
        }
    }
}

/// Everything the orchestrator needs, parsed once at startup.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub topology: ClusterTopology,
    pub kill_signal: KillSignal,
    pub kill_count: usize,
    /// Skip process teardown after a successful run.
    pub leave_running: bool,
    /// Print per-node configuration and stderr on failure.
    pub dump_error_details: bool,
    pub keep_logs: bool,
    /// Kill every node instance on the host, not only ours, before and after.
    pub clean_run: bool,
    /// Seed for fault selection and transfer graphs.
    pub seed: u64,
    /// Fund-spread rounds per validation step.
    pub rounds: usize,
    pub sync: SyncSettings,
    pub retry: RetrySettings,
    pub ledger: LedgerSettings,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            topology: ClusterTopology::default(),
            kill_signal: KillSignal::Term,
            kill_count: 1,
            leave_running: false,
            dump_error_details: false,
            keep_logs: false,
            clean_run: false,
            seed: 1,
            rounds: 10,
            sync: SyncSettings::default(),
            retry: RetrySettings::default(),
            ledger: LedgerSettings::default(),
        }
    }
}

impl ScenarioConfig {
    /// Rejects layouts the scenario cannot run at all. A kill count larger than
    /// the cluster is deliberately *not* rejected here: the fault injector
    /// reports it as `InsufficientNodes` when the kill step is reached.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let topo = &self.topology;
        if topo.total_nodes == 0 {
            return Err(ScenarioError::Config("cluster needs at least one node".into()));
        }
        if topo.producing_nodes == 0 {
            return Err(ScenarioError::Config("at least one producing node is required".into()));
        }
        if topo.producing_nodes > topo.total_nodes {
            return Err(ScenarioError::Config(format!(
                "producing nodes ({}) exceed total nodes ({})",
                topo.producing_nodes, topo.total_nodes
            )));
        }
        if self.sync.poll_interval.is_zero() {
            return Err(ScenarioError::Config("poll interval must be non-zero".into()));
        }
        if self.ledger.account_stake <= self.ledger.max_fee() {
            return Err(ScenarioError::Config("account stake does not cover a transfer fee".into()));
        }
        Ok(())
    }

    /// Number of nodes the fault injector will stop. Zero means one.
    pub fn effective_kill_count(&self) -> usize {
        self.kill_count.max(1)
    }
}
