use metrics::counter;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::config::{ChainSyncStrategy, KillSignal};
use crate::error::{ScenarioError, ScenarioResult};
use crate::node::{NodeId, NodeRole, NodeSet};
use crate::supervisor::NodeSupervisor;

/// Stops a seeded random subset of running nodes and later brings them back.
pub struct FaultInjector {
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    /// Picks `count` victims out of `running`, always leaving one survivor.
    /// The survivor is a producer whenever one is running, so the cluster
    /// keeps producing blocks. A count of zero is treated as one.
    pub fn select_victims(
        &mut self,
        running: &[(NodeId, NodeRole)],
        count: usize,
    ) -> ScenarioResult<Vec<NodeId>> {
        let count = count.max(1);
        let available = running.len().saturating_sub(1);
        if count > available {
            return Err(ScenarioError::InsufficientNodes { requested: count, available });
        }

        let producers: Vec<NodeId> =
            running.iter().filter(|(_, role)| *role == NodeRole::Producer).map(|(id, _)| *id).collect();
        let all: Vec<NodeId> = running.iter().map(|(id, _)| *id).collect();
        let survivor = producers.choose(&mut self.rng).or_else(|| all.choose(&mut self.rng)).copied();

        let candidates: Vec<NodeId> = all.into_iter().filter(|id| Some(*id) != survivor).collect();
        let mut victims: Vec<NodeId> = candidates.choose_multiple(&mut self.rng, count).copied().collect();
        victims.sort();
        Ok(victims)
    }

    /// Kills `count` running nodes with `signal`. Nothing is killed when the
    /// cluster cannot spare that many nodes.
    pub async fn kill_subset<S: NodeSupervisor + ?Sized>(
        &mut self,
        supervisor: &mut S,
        nodes: &mut NodeSet,
        count: usize,
        signal: KillSignal,
    ) -> ScenarioResult<Vec<NodeId>> {
        let victims = self.select_victims(&nodes.running_roles(), count)?;
        info!(?victims, %signal, "injecting node failures");

        for &node in &victims {
            supervisor
                .kill(node, signal)
                .await
                .map_err(|source| ScenarioError::Kill { node, source })?;
            nodes.mark_killed(node);
            counter!("restart_scenario_kills_total", "signal" => signal.as_str()).increment(1);
            info!(%node, %signal, "node killed");
        }
        Ok(victims)
    }

    /// Restarts every killed node with `strategy` and marks it relaunching.
    /// The nodes count as running again only once a sync barrier sees them
    /// converge.
    pub async fn relaunch_all<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &mut S,
        nodes: &mut NodeSet,
        strategy: ChainSyncStrategy,
    ) -> ScenarioResult<Vec<NodeId>> {
        let killed = nodes.killed();
        if killed.is_empty() {
            warn!("relaunch requested but no node is killed");
        }

        for &node in &killed {
            supervisor
                .relaunch(node, strategy)
                .await
                .map_err(|source| ScenarioError::Relaunch { node, source })?;
            nodes.mark_relaunching(node);
            counter!("restart_scenario_relaunches_total").increment(1);
            info!(%node, %strategy, "node relaunched");
        }
        Ok(killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterTopology, LedgerSettings};
    use crate::error::SupervisorError;
    use crate::sim::SimulatedCluster;
    use crate::supervisor::Genesis;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<(NodeId, NodeRole)> {
        (0..n).map(|i| (NodeId(i), NodeRole::Producer)).collect()
    }

    fn one_producer(n: usize) -> Vec<(NodeId, NodeRole)> {
        (0..n)
            .map(|i| (NodeId(i), if i == 0 { NodeRole::Producer } else { NodeRole::NonProducer }))
            .collect()
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

    #[test]
    fn test_selection_is_seeded() {
        let a = FaultInjector::new(1).select_victims(&ids(8), 3).unwrap();
        let b = FaultInjector::new(1).select_victims(&ids(8), 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_zero_means_one() {
        let victims = FaultInjector::new(7).select_victims(&ids(4), 0).unwrap();
        assert_eq!(victims.len(), 1);
    }

    #[test]
    fn test_one_node_always_survives() {
        let mut injector = FaultInjector::new(1);
        assert_eq!(injector.select_victims(&ids(4), 3).unwrap().len(), 3);
        let err = injector.select_victims(&ids(4), 4).unwrap_err();
        assert!(matches!(err, ScenarioError::InsufficientNodes { requested: 4, available: 3 }));
        assert!(injector.select_victims(&ids(1), 1).is_err());
    }

    #[test]
    fn test_last_producer_survives() {
        for seed in 1..=32 {
            let mut injector = FaultInjector::new(seed);
            let victims = injector.select_victims(&one_producer(4), 1).unwrap();
            assert!(!victims.contains(&NodeId(0)), "seed {seed} picked the only producer");
            let victims = injector.select_victims(&one_producer(4), 3).unwrap();
            assert_eq!(victims, vec![NodeId(1), NodeId(2), NodeId(3)]);
        }
    }

    #[test]
    fn test_producers_can_die_while_one_remains() {
        let producers = ids(3);
        let victims = FaultInjector::new(5).select_victims(&producers, 2).unwrap();
        assert_eq!(victims.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_nodes_kills_nothing() {
        let (mut sim, mut nodes) = cluster(3).await;
        let err = FaultInjector::new(1)
            .kill_subset(&mut sim, &mut nodes, 5, KillSignal::Kill)
            .await
            .unwrap_err();
        assert!(matches!(err, ScenarioError::InsufficientNodes { requested: 5, available: 2 }));
        assert!(sim.record().kills.is_empty());
        assert_eq!(nodes.running().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_then_relaunch() {
        let (mut sim, mut nodes) = cluster(4).await;
        let mut injector = FaultInjector::new(1);

        let victims = injector.kill_subset(&mut sim, &mut nodes, 2, KillSignal::Term).await.unwrap();
        assert_eq!(nodes.killed(), victims);
        let recorded: Vec<_> = sim.record().kills.iter().map(|(n, _)| *n).collect();
        assert_eq!(recorded, victims);

        let relaunched = injector
            .relaunch_all(&mut sim, &mut nodes, ChainSyncStrategy::Replay)
            .await
            .unwrap();
        assert_eq!(relaunched, victims);
        assert_eq!(nodes.relaunching(), victims);
        assert!(nodes.killed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_failure_is_classified() {
        let (mut sim, mut nodes) = cluster(3).await;
        let mut injector = FaultInjector::new(3);
        injector.kill_subset(&mut sim, &mut nodes, 1, KillSignal::Kill).await.unwrap();
        sim.fail_relaunches();

        let err = injector
            .relaunch_all(&mut sim, &mut nodes, ChainSyncStrategy::None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScenarioError::Relaunch { source: SupervisorError::Spawn { .. }, .. }));
    }
}
