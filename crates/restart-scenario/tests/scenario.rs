//! Full restart scenario runs against the in-process cluster.

use alloy_primitives::U256;
use restart_scenario::supervisor::{NodeSupervisor, TeardownOptions};
use restart_scenario::{
    ChainSyncStrategy, ConsistencyFailure, KeystoreWallet, KillSignal, NodeId, Scenario,
    ScenarioConfig, ScenarioError, ScenarioState, SimulatedCluster, TopologyShape, WalletService,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn config(total: usize, producers: usize) -> ScenarioConfig {
    let mut config = ScenarioConfig { rounds: 3, ..Default::default() };
    config.topology.total_nodes = total;
    config.topology.producing_nodes = producers;
    config
}

async fn run<W: WalletService>(
    config: ScenarioConfig,
    sim: &SimulatedCluster,
    wallet: W,
) -> (Scenario<SimulatedCluster, W>, restart_scenario::ScenarioReport) {
    init_tracing();
    let mut scenario = Scenario::new(config, sim.clone(), wallet).unwrap();
    let report = scenario.run(std::future::pending()).await;
    (scenario, report)
}

#[tokio::test(start_paused = true)]
async fn test_four_node_ring_survives_restart() {
    let mut config = config(4, 2);
    config.topology.shape = TopologyShape::Ring;
    config.kill_signal = KillSignal::Term;
    config.kill_count = 1;
    config.leave_running = true;

    let sim = SimulatedCluster::default();
    let (scenario, report) = run(config, &sim, KeystoreWallet::in_memory()).await;

    assert!(report.passed, "scenario failed: {:?}", report.error);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.final_state, ScenarioState::Done);
    assert_eq!(report.killed.len(), 1);
    assert!(report.transfers > 0);

    let record = sim.record();
    assert_eq!(record.kills, vec![(report.killed[0], KillSignal::Term)]);
    assert_eq!(record.relaunches, vec![(report.killed[0], ChainSyncStrategy::None)]);
    assert_eq!(
        record.teardowns,
        vec![TeardownOptions { stop_nodes: false, all_instances: false, remove_state: false }]
    );
    assert_eq!(scenario.nodes().running().len(), 4);

    // Every node ends with the same balances.
    for account in scenario.participants() {
        let mut balances = Vec::new();
        for i in 0..4 {
            balances.push(sim.query_account(NodeId(i), account.address).await.unwrap().balance);
        }
        assert!(balances.windows(2).all(|w| w[0] == w[1]), "{}: {balances:?}", account.name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_resync_with_sigkill_passes() {
    let mut config = config(3, 3);
    config.topology.chain_sync = ChainSyncStrategy::Resync;
    config.kill_signal = KillSignal::Kill;

    let sim = SimulatedCluster::default();
    let (_, report) = run(config, &sim, KeystoreWallet::in_memory()).await;

    assert!(report.passed, "scenario failed: {:?}", report.error);
    let record = sim.record();
    assert_eq!(record.relaunches.len(), 1);
    assert_eq!(record.relaunches[0].1, ChainSyncStrategy::Resync);
    assert_eq!(
        record.teardowns,
        vec![TeardownOptions { stop_nodes: true, all_instances: false, remove_state: true }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_single_producer_keeps_producing_after_kill() {
    for seed in [2, 3, 6] {
        let mut config = config(4, 1);
        config.seed = seed;

        let sim = SimulatedCluster::default();
        let (_, report) = run(config, &sim, KeystoreWallet::in_memory()).await;

        assert!(report.passed, "seed {seed}: {:?}", report.error);
        assert_eq!(report.killed.len(), 1);
        assert_ne!(report.killed[0], NodeId(0), "seed {seed}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_finished_scenario_does_not_rerun() {
    let sim = SimulatedCluster::default();
    sim.fail_launch();
    let (mut scenario, first) = run(config(2, 2), &sim, KeystoreWallet::in_memory()).await;
    assert!(!first.passed);

    let second = scenario.run(std::future::pending()).await;
    assert!(!second.passed);
    assert_eq!(second.final_state, ScenarioState::Failed);
    assert!(matches!(second.error, Some(ScenarioError::AlreadyFinished(ScenarioState::Failed))));
    assert_eq!(sim.record().teardowns.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_kill_count_kills_nothing() {
    let mut config = config(3, 2);
    config.kill_count = 5;

    let sim = SimulatedCluster::default();
    let (_, report) = run(config, &sim, KeystoreWallet::in_memory()).await;

    assert!(!report.passed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.final_state, ScenarioState::Failed);
    assert_eq!(report.failed_step, Some(ScenarioState::NodesKilled));
    assert!(matches!(
        report.error,
        Some(ScenarioError::InsufficientNodes { requested: 5, available: 2 })
    ));

    let record = sim.record();
    assert!(record.kills.is_empty());
    assert_eq!(
        record.teardowns,
        vec![TeardownOptions { stop_nodes: true, all_instances: false, remove_state: false }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_relaunch_is_sync_timeout() {
    let mut config = config(3, 2);
    config.topology.chain_sync = ChainSyncStrategy::Resync;
    config.sync.sync_timeout = Duration::from_secs(20);

    let sim = SimulatedCluster::default();
    sim.stall_relaunches();
    let (scenario, report) = run(config, &sim, KeystoreWallet::in_memory()).await;

    assert_eq!(report.failed_step, Some(ScenarioState::Resynced));
    assert!(matches!(report.error, Some(ScenarioError::SyncTimeout { timeout_secs: 20, .. })));
    assert_eq!(scenario.nodes().relaunching(), report.killed);
    assert_eq!(sim.record().teardowns.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_divergent_node_fails_validation() {
    let mut config = config(3, 2);
    config.dump_error_details = true;

    let sim = SimulatedCluster::default();
    sim.diverge(NodeId(1), U256::from(1));
    let (_, report) = run(config, &sim, KeystoreWallet::in_memory()).await;

    assert_eq!(report.failed_step, Some(ScenarioState::PreKillValidated));
    assert!(matches!(
        report.error,
        Some(ScenarioError::Consistency(ConsistencyFailure::NodeDiverged { node: NodeId(1), .. }))
    ));
    assert!(sim.record().kills.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_still_tears_down() {
    let sim = SimulatedCluster::default();
    sim.fail_launch();
    let (_, report) = run(config(2, 2), &sim, KeystoreWallet::in_memory()).await;

    assert_eq!(report.failed_step, Some(ScenarioState::ClusterUp));
    assert!(matches!(report.error, Some(ScenarioError::Launch(_))));
    assert_eq!(sim.record().teardowns.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relaunch_failure_is_reported() {
    let sim = SimulatedCluster::default();
    sim.fail_relaunches();
    let (_, report) = run(config(3, 2), &sim, KeystoreWallet::in_memory()).await;

    assert_eq!(report.failed_step, Some(ScenarioState::Relaunched));
    assert!(matches!(report.error, Some(ScenarioError::Relaunch { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_signal_cancels_run() {
    init_tracing();
    let sim = SimulatedCluster::default();
    let mut scenario = Scenario::new(config(3, 2), sim.clone(), KeystoreWallet::in_memory()).unwrap();

    let report = scenario.run(tokio::time::sleep(Duration::from_secs(2))).await;

    assert!(matches!(report.error, Some(ScenarioError::Cancelled)));
    assert_eq!(report.final_state, ScenarioState::Failed);
    assert_eq!(sim.record().teardowns.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clean_run_and_keep_logs() {
    let mut config = config(2, 2);
    config.clean_run = true;
    config.keep_logs = true;

    let sim = SimulatedCluster::default();
    let (_, report) = run(config, &sim, KeystoreWallet::in_memory()).await;

    assert!(report.passed, "scenario failed: {:?}", report.error);
    let record = sim.record();
    assert_eq!(record.prepare_calls, vec![true]);
    assert_eq!(
        record.teardowns,
        vec![TeardownOptions { stop_nodes: true, all_instances: true, remove_state: false }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_persistent_wallet_removed_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let wallet = KeystoreWallet::persistent(dir.path()).with_scrypt_log_n(4);

    let sim = SimulatedCluster::default();
    let (_, report) = run(config(2, 2), &sim, wallet).await;

    assert!(report.passed, "scenario failed: {:?}", report.error);
    assert!(!dir.path().join("restart-scenario").exists());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected() {
    let sim = SimulatedCluster::default();
    let err = Scenario::new(config(2, 3), sim, KeystoreWallet::in_memory()).err().unwrap();
    assert!(matches!(err, ScenarioError::Config(_)));
}
