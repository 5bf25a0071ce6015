//! The restart scenario state machine.
//!
//! Steps run strictly one after another. The first failing step aborts the
//! run with a classified [`ScenarioError`]; teardown then runs exactly once
//! whichever way the run ended, including cancellation by a process signal.

use metrics::{counter, gauge};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::accounts::{AccountProvisioner, CREATOR_ACCOUNT, import_accounts};
use crate::config::ScenarioConfig;
use crate::error::{ScenarioError, ScenarioResult};
use crate::fault_injector::FaultInjector;
use crate::fund_spread::FundSpreadValidator;
use crate::ledger::{Account, deterministic_address, participant_names};
use crate::node::{NodeId, NodeSet};
use crate::supervisor::{Genesis, NodeSupervisor, TeardownOptions};
use crate::sync_barrier::SyncBarrier;
use crate::wallet::WalletService;

/// Name of the wallet holding every scenario key.
pub const WALLET_NAME: &str = "restart-scenario";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScenarioState {
    Init,
    ClusterUp,
    Stabilized,
    AccountsReady,
    PreKillValidated,
    NodesKilled,
    PostKillValidated,
    Relaunched,
    Resynced,
    PostResyncValidated,
    Done,
    Failed,
}

impl ScenarioState {
    /// The step that follows a successful `self`. Terminal states have none.
    pub fn next(self) -> Option<Self> {
        use ScenarioState::*;
        Some(match self {
            Init => ClusterUp,
            ClusterUp => Stabilized,
            Stabilized => AccountsReady,
            AccountsReady => PreKillValidated,
            PreKillValidated => NodesKilled,
            NodesKilled => PostKillValidated,
            PostKillValidated => Relaunched,
            Relaunched => Resynced,
            Resynced => PostResyncValidated,
            PostResyncValidated => Done,
            Done | Failed => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ClusterUp => "cluster-up",
            Self::Stabilized => "stabilized",
            Self::AccountsReady => "accounts-ready",
            Self::PreKillValidated => "pre-kill-validated",
            Self::NodesKilled => "nodes-killed",
            Self::PostKillValidated => "post-kill-validated",
            Self::Relaunched => "relaunched",
            Self::Resynced => "resynced",
            Self::PostResyncValidated => "post-resync-validated",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one scenario run.
#[derive(Debug)]
pub struct ScenarioReport {
    pub passed: bool,
    /// `Done` on success, `Failed` otherwise.
    pub final_state: ScenarioState,
    /// The step that was executing when the run failed.
    pub failed_step: Option<ScenarioState>,
    pub error: Option<ScenarioError>,
    pub killed: Vec<NodeId>,
    pub transfers: usize,
    pub elapsed: Duration,
}

impl ScenarioReport {
    pub fn exit_code(&self) -> i32 {
        if self.passed { 0 } else { 1 }
    }
}

pub struct Scenario<S, W> {
    config: ScenarioConfig,
    supervisor: S,
    wallet: W,
    nodes: NodeSet,
    barrier: SyncBarrier,
    injector: FaultInjector,
    provisioner: AccountProvisioner,
    validator: FundSpreadValidator,
    state: ScenarioState,
    creator: Option<Account>,
    participants: Vec<Account>,
    killed: Vec<NodeId>,
    transfers: usize,
    torn_down: bool,
}

impl<S: NodeSupervisor, W: WalletService> Scenario<S, W> {
    pub fn new(config: ScenarioConfig, supervisor: S, wallet: W) -> ScenarioResult<Self> {
        config.validate()?;
        Ok(Self {
            barrier: SyncBarrier::new(config.sync.clone()),
            injector: FaultInjector::new(config.seed),
            provisioner: AccountProvisioner::new(config.ledger.clone(), config.retry.clone()),
            validator: FundSpreadValidator::new(
                config.seed,
                config.ledger.clone(),
                config.retry.clone(),
                config.sync.clone(),
            ),
            config,
            supervisor,
            wallet,
            nodes: NodeSet::default(),
            state: ScenarioState::Init,
            creator: None,
            participants: Vec::new(),
            killed: Vec::new(),
            transfers: 0,
            torn_down: false,
        })
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    pub fn creator(&self) -> Option<&Account> {
        self.creator.as_ref()
    }

    pub fn participants(&self) -> &[Account] {
        &self.participants
    }

    /// Drives the scenario to `Done` or `Failed`. Resolving `shutdown` cancels
    /// the current step and goes straight to teardown.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) -> ScenarioReport {
        if self.state != ScenarioState::Init {
            warn!(state = %self.state, "scenario already ran");
            return ScenarioReport {
                passed: false,
                final_state: self.state,
                failed_step: None,
                error: Some(ScenarioError::AlreadyFinished(self.state)),
                killed: self.killed.clone(),
                transfers: self.transfers,
                elapsed: Duration::ZERO,
            };
        }

        let started = Instant::now();
        info!(
            nodes = self.config.topology.total_nodes,
            producers = self.config.topology.producing_nodes,
            shape = %self.config.topology.shape,
            chain_sync = %self.config.topology.chain_sync,
            kill_signal = %self.config.kill_signal,
            kill_count = self.config.effective_kill_count(),
            seed = self.config.seed,
            "starting restart scenario"
        );

        let outcome = tokio::select! {
            result = self.drive() => result,
            _ = shutdown => {
                warn!(state = %self.state, "shutdown requested, aborting scenario");
                Err(ScenarioError::Cancelled)
            }
        };

        let (passed, failed_step, error) = match outcome {
            Ok(()) => (true, None, None),
            Err(e) => {
                let step = self.state.next().unwrap_or(self.state);
                error!(step = %step, error = %e, "scenario FAILED");
                counter!("restart_scenario_failures_total", "step" => step.as_str()).increment(1);
                self.state = ScenarioState::Failed;
                (false, Some(step), Some(e))
            }
        };

        self.teardown(passed).await;
        let elapsed = started.elapsed();
        if passed {
            info!(elapsed_secs = elapsed.as_secs(), transfers = self.transfers, "=== Restart scenario PASSED ===");
        }

        ScenarioReport {
            passed,
            final_state: self.state,
            failed_step,
            error,
            killed: self.killed.clone(),
            transfers: self.transfers,
            elapsed,
        }
    }

    async fn drive(&mut self) -> ScenarioResult<()> {
        while let Some(step) = self.state.next() {
            info!("=== Step: {step} ===");
            self.execute(step).await?;
            self.state = step;
            gauge!("restart_scenario_step").set(step as u8 as f64);
        }
        Ok(())
    }

    async fn execute(&mut self, step: ScenarioState) -> ScenarioResult<()> {
        match step {
            ScenarioState::ClusterUp => self.launch_cluster().await,
            ScenarioState::Stabilized => self.stabilize().await,
            ScenarioState::AccountsReady => self.provision_accounts().await,
            ScenarioState::PreKillValidated
            | ScenarioState::PostKillValidated
            | ScenarioState::PostResyncValidated => self.validate_funds().await,
            ScenarioState::NodesKilled => {
                self.killed = self
                    .injector
                    .kill_subset(
                        &mut self.supervisor,
                        &mut self.nodes,
                        self.config.effective_kill_count(),
                        self.config.kill_signal,
                    )
                    .await?;
                Ok(())
            }
            ScenarioState::Relaunched => {
                self.injector
                    .relaunch_all(&mut self.supervisor, &mut self.nodes, self.config.topology.chain_sync)
                    .await?;
                Ok(())
            }
            // The barrier promotes relaunched nodes back to running once they converge.
            ScenarioState::Resynced => self.wait_for_sync().await,
            ScenarioState::Init | ScenarioState::Done | ScenarioState::Failed => Ok(()),
        }
    }

    async fn launch_cluster(&mut self) -> ScenarioResult<()> {
        self.supervisor.prepare(self.config.clean_run).await.map_err(ScenarioError::Launch)?;

        let creator = deterministic_address(CREATOR_ACCOUNT)?;
        let genesis = Genesis {
            chain_id: self.config.ledger.chain_id,
            alloc: BTreeMap::from([(creator, self.config.ledger.creator_balance)]),
        };
        let instances = self
            .supervisor
            .launch(&self.config.topology, &genesis)
            .await
            .map_err(ScenarioError::Launch)?;
        self.nodes = NodeSet::new(instances);
        info!(nodes = self.nodes.len(), "cluster up");
        Ok(())
    }

    async fn stabilize(&mut self) -> ScenarioResult<()> {
        let height = self.config.sync.stabilization_height;
        let timeout = self.config.sync.stabilization_timeout;
        info!(height, "waiting for block production");
        if !self.barrier.wait_for_height(&self.supervisor, &mut self.nodes, height, timeout).await? {
            return Err(ScenarioError::StabilizationTimeout { height, timeout_secs: timeout.as_secs() });
        }
        Ok(())
    }

    async fn provision_accounts(&mut self) -> ScenarioResult<()> {
        self.wallet.create(WALLET_NAME)?;
        let creator = import_accounts(&mut self.wallet, &[CREATOR_ACCOUNT.to_string()])?.remove(0);
        let participants =
            import_accounts(&mut self.wallet, &participant_names(self.config.topology.total_nodes))?;

        self.provisioner
            .create_accounts(&self.supervisor, &self.wallet, &self.nodes, &creator, &participants)
            .await?;
        self.creator = Some(creator);
        self.participants = participants;
        self.wait_for_sync().await
    }

    async fn validate_funds(&mut self) -> ScenarioResult<()> {
        let report = self
            .validator
            .spread_funds_and_validate(
                &self.supervisor,
                &self.wallet,
                &self.barrier,
                &mut self.nodes,
                &self.participants,
                self.config.rounds,
            )
            .await?;
        self.transfers += report.transfers;
        self.wait_for_sync().await
    }

    async fn wait_for_sync(&mut self) -> ScenarioResult<()> {
        let timeout = self.config.sync.sync_timeout;
        let synced = self
            .barrier
            .wait_for_sync(&self.supervisor, &mut self.nodes, self.config.sync.height_delta, timeout)
            .await?;
        if !synced {
            return Err(ScenarioError::SyncTimeout {
                timeout_secs: timeout.as_secs(),
                heights: self.nodes.height_summary(),
            });
        }
        Ok(())
    }

    /// Stops the cluster and closes the wallet. Runs at most once.
    ///
    /// After a failure every node is stopped and all state is kept for
    /// inspection. After a success nodes keep running with `leave_running`
    /// and state is removed unless `keep_logs`.
    async fn teardown(&mut self, passed: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if !passed && self.config.dump_error_details {
            self.dump_diagnostics();
        }

        let options = if passed {
            let stop_nodes = !self.config.leave_running;
            TeardownOptions {
                stop_nodes,
                all_instances: self.config.clean_run && stop_nodes,
                remove_state: stop_nodes && !self.config.keep_logs,
            }
        } else {
            TeardownOptions { stop_nodes: true, all_instances: self.config.clean_run, remove_state: false }
        };
        info!(?options, "tearing down");

        if let Err(e) = self.supervisor.shutdown(options).await {
            warn!(error = %e, "supervisor shutdown failed");
        }
        if let Err(e) = self.wallet.shutdown(options.remove_state) {
            warn!(error = %e, "wallet shutdown failed");
        }
    }

    fn dump_diagnostics(&self) {
        for diag in self.supervisor.diagnostics() {
            println!("==================== {} config ====================", diag.node);
            println!("{}", diag.config);
            println!("==================== {} stderr ====================", diag.node);
            println!("{}", diag.stderr_tail);
        }
        println!("heights: {}", self.nodes.height_summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_sequence() {
        let mut states = vec![ScenarioState::Init];
        while let Some(next) = states.last().and_then(|s| s.next()) {
            states.push(next);
        }
        assert_eq!(states.len(), 11);
        assert_eq!(states.last(), Some(&ScenarioState::Done));
        assert!(states.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ScenarioState::Failed.next(), None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ScenarioState::PreKillValidated.to_string(), "pre-kill-validated");
        assert_eq!(ScenarioState::Done.as_str(), "done");
    }

    #[test]
    fn test_report_exit_code() {
        let mut report = ScenarioReport {
            passed: true,
            final_state: ScenarioState::Done,
            failed_step: None,
            error: None,
            killed: vec![NodeId(1)],
            transfers: 4,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(report.exit_code(), 0);
        report.passed = false;
        assert_eq!(report.exit_code(), 1);
    }
}
