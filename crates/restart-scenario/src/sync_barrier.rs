//! Height polling until the live node set satisfies a convergence predicate.

use futures::future::join_all;
use metrics::{counter, gauge};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::{ScenarioError, ScenarioResult};
use crate::node::{NodeId, NodeSet};
use crate::supervisor::NodeSupervisor;

/// Predicate a barrier waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    /// Every live node within `delta` of the highest live node, and that
    /// highest height unchanged since the previous poll.
    Converged { delta: u64 },
    /// Every live node at or above the height.
    MinHeight(u64),
}

/// One poll's answers. `None` means the node did not answer in time.
pub type HeightSample = Vec<(NodeId, Option<u64>)>;

/// Whether `sample` satisfies `target`. `previous_max` is the highest height
/// seen on the poll before this one.
pub fn evaluate(target: SyncTarget, sample: &[(NodeId, Option<u64>)], previous_max: Option<u64>) -> bool {
    if sample.is_empty() {
        return false;
    }
    let Some(heights) = sample.iter().map(|(_, h)| *h).collect::<Option<Vec<u64>>>() else {
        return false;
    };

    match target {
        SyncTarget::MinHeight(min) => heights.iter().all(|h| *h >= min),
        SyncTarget::Converged { delta } => {
            let max = heights.iter().copied().max().unwrap_or(0);
            let min = heights.iter().copied().min().unwrap_or(0);
            max - min <= delta && previous_max == Some(max)
        }
    }
}

pub struct SyncBarrier {
    settings: SyncSettings,
}

impl SyncBarrier {
    pub fn new(settings: SyncSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Waits until every live node is within `delta` of the maximum height and
    /// the maximum has stopped moving for one poll. `Ok(false)` on timeout.
    pub async fn wait_for_sync<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        nodes: &mut NodeSet,
        delta: u64,
        timeout: Duration,
    ) -> ScenarioResult<bool> {
        self.wait(supervisor, nodes, SyncTarget::Converged { delta }, timeout).await
    }

    /// Waits until every live node has reached `min_height`. `Ok(false)` on timeout.
    pub async fn wait_for_height<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        nodes: &mut NodeSet,
        min_height: u64,
        timeout: Duration,
    ) -> ScenarioResult<bool> {
        self.wait(supervisor, nodes, SyncTarget::MinHeight(min_height), timeout).await
    }

    async fn wait<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        nodes: &mut NodeSet,
        target: SyncTarget,
        wait_timeout: Duration,
    ) -> ScenarioResult<bool> {
        let deadline = Instant::now() + wait_timeout;
        let mut previous_max = None;
        let mut unreachable_polls = 0u32;

        loop {
            let live = nodes.live();
            let sample = self.poll_heights(supervisor, &live).await;
            counter!("restart_scenario_barrier_polls_total").increment(1);

            for (id, height) in &sample {
                if let Some(height) = height {
                    nodes.record_height(*id, *height);
                }
            }

            if sample.iter().all(|(_, h)| h.is_none()) {
                unreachable_polls += 1;
                if unreachable_polls >= self.settings.max_unreachable_polls {
                    warn!(polls = unreachable_polls, "no live node answered");
                    return Err(ScenarioError::NodesUnreachable { polls: unreachable_polls });
                }
            } else {
                unreachable_polls = 0;
            }

            let max = sample.iter().filter_map(|(_, h)| *h).max();
            if let Some(max) = max {
                gauge!("restart_scenario_max_height").set(max as f64);
            }

            if evaluate(target, &sample, previous_max) {
                let rejoined = nodes.confirm_rejoined();
                if !rejoined.is_empty() {
                    counter!("restart_scenario_rejoined_total").increment(rejoined.len() as u64);
                    info!(?rejoined, "relaunched nodes back in sync");
                }
                info!(?target, heights = %nodes.height_summary(), "barrier satisfied");
                return Ok(true);
            }
            debug!(?target, heights = %nodes.height_summary(), "barrier not yet satisfied");
            previous_max = max;

            if Instant::now() >= deadline {
                counter!("restart_scenario_barrier_timeouts_total").increment(1);
                warn!(
                    ?target,
                    timeout_secs = wait_timeout.as_secs(),
                    heights = %nodes.height_summary(),
                    "barrier timed out"
                );
                return Ok(false);
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Queries every node concurrently, each bounded by the query timeout.
    async fn poll_heights<S: NodeSupervisor + ?Sized>(&self, supervisor: &S, live: &[NodeId]) -> HeightSample {
        let query_timeout = self.settings.query_timeout;
        let queries = live.iter().map(|&id| async move {
            match timeout(query_timeout, supervisor.query_height(id)).await {
                Ok(Ok(height)) => (id, Some(height)),
                Ok(Err(e)) => {
                    debug!(node = %id, error = %e, "height query failed");
                    (id, None)
                }
                Err(_) => {
                    debug!(node = %id, "height query timed out");
                    (id, None)
                }
            }
        });
        join_all(queries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainSyncStrategy, ClusterTopology, KillSignal, LedgerSettings};
    use crate::sim::SimulatedCluster;
    use crate::supervisor::Genesis;
    use std::collections::BTreeMap;

    fn sample(heights: &[Option<u64>]) -> HeightSample {
        heights.iter().enumerate().map(|(i, h)| (NodeId(i), *h)).collect()
    }

    async fn cluster(total: usize) -> (SimulatedCluster, NodeSet) {
        let mut sim = SimulatedCluster::default();
        let topology = ClusterTopology {
            total_nodes: total,
            producing_nodes: 1,
            launch_delay: Duration::ZERO,
            ..Default::default()
        };
        let genesis = Genesis { chain_id: LedgerSettings::default().chain_id, alloc: BTreeMap::new() };
        let instances = sim.launch(&topology, &genesis).await.unwrap();
        (sim, NodeSet::new(instances))
    }

    fn barrier() -> SyncBarrier {
        SyncBarrier::new(SyncSettings { max_unreachable_polls: 3, ..Default::default() })
    }

    #[test]
    fn test_evaluate_min_height() {
        let target = SyncTarget::MinHeight(3);
        assert!(evaluate(target, &sample(&[Some(3), Some(5)]), None));
        assert!(!evaluate(target, &sample(&[Some(3), Some(2)]), None));
        assert!(!evaluate(target, &sample(&[Some(3), None]), None));
        assert!(!evaluate(target, &[], None));
    }

    #[test]
    fn test_evaluate_converged_needs_stable_max() {
        let target = SyncTarget::Converged { delta: 2 };
        let s = sample(&[Some(10), Some(8)]);
        assert!(!evaluate(target, &s, None));
        assert!(!evaluate(target, &s, Some(9)));
        assert!(evaluate(target, &s, Some(10)));
        assert!(!evaluate(target, &sample(&[Some(10), Some(7)]), Some(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_height_reaches_stabilization() {
        let (sim, mut nodes) = cluster(3).await;
        let reached = barrier().wait_for_height(&sim, &mut nodes, 3, Duration::from_secs(60)).await.unwrap();
        assert!(reached);
        assert!(nodes.iter().all(|n| n.last_height.unwrap() >= 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunched_node_confirmed_running() {
        let (mut sim, mut nodes) = cluster(3).await;
        sleep(Duration::from_secs(3)).await;
        sim.kill(NodeId(2), KillSignal::Term).await.unwrap();
        nodes.mark_killed(NodeId(2));

        sleep(Duration::from_secs(5)).await;
        sim.relaunch(NodeId(2), ChainSyncStrategy::Replay).await.unwrap();
        nodes.mark_relaunching(NodeId(2));

        let synced = barrier().wait_for_sync(&sim, &mut nodes, 0, Duration::from_secs(30)).await.unwrap();
        assert!(synced);
        assert_eq!(nodes.running().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_node_times_out() {
        let (mut sim, mut nodes) = cluster(3).await;
        sim.stall_relaunches();
        sim.kill(NodeId(1), KillSignal::Kill).await.unwrap();
        nodes.mark_killed(NodeId(1));
        sleep(Duration::from_secs(5)).await;
        sim.relaunch(NodeId(1), ChainSyncStrategy::None).await.unwrap();
        nodes.mark_relaunching(NodeId(1));

        let synced = barrier().wait_for_sync(&sim, &mut nodes, 2, Duration::from_secs(10)).await.unwrap();
        assert!(!synced);
        assert_eq!(nodes.relaunching(), vec![NodeId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_killed_node_excluded_from_convergence() {
        let (mut sim, mut nodes) = cluster(3).await;
        sleep(Duration::from_secs(2)).await;
        sim.kill(NodeId(2), KillSignal::Term).await.unwrap();
        nodes.mark_killed(NodeId(2));
        sleep(Duration::from_secs(10)).await;

        let synced = barrier().wait_for_sync(&sim, &mut nodes, 0, Duration::from_secs(10)).await.unwrap();
        assert!(synced);
        assert!(nodes.height_summary().contains("node_02=killed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_unreachable_fails_fast() {
        let (sim, mut nodes) = cluster(2).await;
        sim.set_unreachable(NodeId(0), true);
        sim.set_unreachable(NodeId(1), true);

        let err = barrier().wait_for_sync(&sim, &mut nodes, 2, Duration::from_secs(600)).await.unwrap_err();
        assert!(matches!(err, ScenarioError::NodesUnreachable { polls: 3 }));
    }
}
