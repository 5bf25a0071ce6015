use clap::Parser;
use restart_scenario::supervisor::process::find_node_binary;
use restart_scenario::{
    ChainSyncStrategy, ClusterTopology, KeystoreWallet, KillSignal, NodeSupervisor, P2pPlugin,
    ProcessSupervisor, ProcessSupervisorConfig, Scenario, ScenarioConfig, ScenarioReport,
    SimulatedCluster, SyncSettings, TopologyShape, WalletService,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Binary looked up on `PATH` when `--node-binary` is not given.
const DEFAULT_NODE_BINARY: &str = "ledger-node";

#[derive(Parser, Debug)]
#[command(
    name = "restart-scenarios-test",
    about = "Kill/relaunch fault-tolerance scenario for a replicated ledger cluster"
)]
struct Cli {
    /// Number of producing nodes.
    #[arg(short = 'p', long = "producers", default_value_t = 2)]
    producers: usize,

    /// Total number of nodes. Defaults to the number of producing nodes.
    #[arg(short = 'n', long = "nodes")]
    nodes: Option<usize>,

    /// Peer topology: mesh, ring, star, line or bridge.
    #[arg(short = 's', long = "shape", default_value = "mesh")]
    shape: TopologyShape,

    /// Delay in seconds between node launches.
    #[arg(short = 'd', long = "delay", default_value_t = 1)]
    delay: u64,

    /// How relaunched nodes recover their chain: replay, resync or none.
    #[arg(short = 'c', long = "chain-sync", default_value = "none")]
    chain_sync: ChainSyncStrategy,

    /// Enable debug logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Signal delivered to killed nodes: term or kill.
    #[arg(long = "kill-sig", default_value = "term")]
    kill_sig: KillSignal,

    /// Number of nodes to kill. 0 means 1.
    #[arg(long, default_value_t = 1)]
    kill_count: usize,

    /// Leave the cluster running after a successful run.
    #[arg(long)]
    leave_running: bool,

    /// Print node configuration and stderr logs on failure.
    #[arg(long)]
    dump_error_details: bool,

    /// Keep node data and log directories after a successful run.
    #[arg(long)]
    keep_logs: bool,

    /// Kill every node instance on this host before and after the run.
    #[arg(long)]
    clean_run: bool,

    /// Peer-to-peer plugin: net or bnet.
    #[arg(long, default_value = "net")]
    p2p_plugin: P2pPlugin,

    /// Seed for victim selection and transfer graphs.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Fund-spread rounds per validation step.
    #[arg(long, default_value_t = 10)]
    rounds: usize,

    /// Path to the ledger node binary. Auto-detected if not specified.
    #[arg(long, env = "LEDGER_NODE_BINARY")]
    node_binary: Option<PathBuf>,

    /// Root directory for per-node configuration, data and logs.
    #[arg(long, env = "RESTART_SCENARIO_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Run against the in-process simulated cluster instead of real nodes.
    #[arg(long)]
    simulate: bool,

    /// Seconds to wait for the cluster to converge.
    #[arg(long, env = "RESTART_SCENARIO_SYNC_TIMEOUT", default_value_t = 120)]
    sync_timeout: u64,

    /// Seconds to wait for initial block production.
    #[arg(long, env = "RESTART_SCENARIO_STABILIZATION_TIMEOUT", default_value_t = 60)]
    stabilization_timeout: u64,

    /// Seconds a single node query may take.
    #[arg(long, env = "RESTART_SCENARIO_QUERY_TIMEOUT", default_value_t = 5)]
    query_timeout: u64,

    /// Milliseconds between height polls.
    #[arg(long, env = "RESTART_SCENARIO_POLL_INTERVAL_MS", default_value_t = 200)]
    poll_interval_ms: u64,

    /// Allowed height distance between a node and the highest node.
    #[arg(long, env = "RESTART_SCENARIO_HEIGHT_DELTA", default_value_t = 2)]
    height_delta: u64,
}

impl Cli {
    fn scenario_config(&self) -> ScenarioConfig {
        ScenarioConfig {
            topology: ClusterTopology {
                total_nodes: self.nodes.unwrap_or(self.producers),
                producing_nodes: self.producers,
                launch_delay: Duration::from_secs(self.delay),
                shape: self.shape,
                chain_sync: self.chain_sync,
                p2p_plugin: self.p2p_plugin,
            },
            kill_signal: self.kill_sig,
            kill_count: self.kill_count,
            leave_running: self.leave_running,
            dump_error_details: self.dump_error_details,
            keep_logs: self.keep_logs,
            clean_run: self.clean_run,
            seed: self.seed,
            rounds: self.rounds,
            sync: SyncSettings {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                query_timeout: Duration::from_secs(self.query_timeout),
                height_delta: self.height_delta,
                sync_timeout: Duration::from_secs(self.sync_timeout),
                stabilization_timeout: Duration::from_secs(self.stabilization_timeout),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_scenario<S: NodeSupervisor, W: WalletService>(
    config: ScenarioConfig,
    supervisor: S,
    wallet: W,
) -> eyre::Result<ScenarioReport> {
    let mut scenario = Scenario::new(config, supervisor, wallet)?;
    Ok(scenario.run(shutdown_signal()).await)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.scenario_config();
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid arguments");
        std::process::exit(2);
    }

    let report = if cli.simulate {
        info!("running against the simulated cluster");
        run_scenario(config, SimulatedCluster::default(), KeystoreWallet::in_memory()).await?
    } else {
        let binary_path = match cli.node_binary.clone().or_else(|| find_node_binary(DEFAULT_NODE_BINARY)) {
            Some(path) => path,
            None => eyre::bail!(
                "{DEFAULT_NODE_BINARY} not found: pass --node-binary or set LEDGER_NODE_BINARY"
            ),
        };
        let work_dir = cli
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("restart-scenario"));
        info!(binary = %binary_path.display(), work_dir = %work_dir.display(), "using ledger node binary");

        let mut supervisor_config = ProcessSupervisorConfig::new(binary_path, work_dir.clone());
        supervisor_config.rpc_timeout = config.sync.query_timeout;
        let wallet = KeystoreWallet::persistent(work_dir.join("wallet"));
        run_scenario(config, ProcessSupervisor::new(supervisor_config), wallet).await?
    };

    info!(
        passed = report.passed,
        killed = ?report.killed,
        transfers = report.transfers,
        elapsed_secs = report.elapsed.as_secs(),
        "restart scenario complete"
    );
    if let (Some(step), Some(e)) = (report.failed_step, &report.error) {
        error!(%step, error = %e, "FAILED");
    }

    std::process::exit(report.exit_code());
}
