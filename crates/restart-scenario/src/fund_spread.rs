//! Synthetic transfer workload and cross-node balance validation.
//!
//! Every round moves funds between participants along a seeded random graph,
//! waits until all live nodes applied the including blocks, and checks that
//! every running node reports the same balances, that those balances match
//! the transfer arithmetic, and that only fees left the participant set.

use alloy_primitives::{B256, U256};
use futures::future::join_all;
use metrics::counter;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::accounts::query_any;
use crate::config::{LedgerSettings, RetrySettings, SyncSettings};
use crate::error::{ConsistencyFailure, ScenarioError, ScenarioResult, SupervisorError};
use crate::ledger::{Account, Transfer, TxReceipt};
use crate::node::{NodeId, NodeSet};
use crate::supervisor::NodeSupervisor;
use crate::sync_barrier::SyncBarrier;
use crate::wallet::WalletService;

/// One edge of a round's transfer graph, by participant index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub from: usize,
    pub to: usize,
    pub value: U256,
}

/// Draws one round's transfer graph. Each participant sends at most once, never
/// to itself, and at most a quarter of what it holds beyond one maximum fee.
pub fn plan_round<R: Rng>(rng: &mut R, balances: &[U256], max_fee: U256) -> Vec<PlannedTransfer> {
    let n = balances.len();
    if n < 2 {
        return Vec::new();
    }

    let mut senders: Vec<usize> = (0..n).collect();
    senders.shuffle(rng);

    let mut plan = Vec::with_capacity(n);
    for from in senders {
        let spendable = balances[from].saturating_sub(max_fee);
        let cap = spendable / U256::from(4u64);
        if cap.is_zero() {
            continue;
        }
        let value = cap * U256::from(rng.gen_range(1..=100u64)) / U256::from(100u64);
        if value.is_zero() {
            continue;
        }
        let mut to = rng.gen_range(0..n - 1);
        if to >= from {
            to += 1;
        }
        plan.push(PlannedTransfer { from, to, value });
    }
    plan
}

/// Compares per-node answers and returns the majority balance of each account.
///
/// `answers` holds one balance vector per node, aligned with `participants`.
/// Ties go to the value reported by the lowest node.
pub fn check_consistency(
    participants: &[Account],
    answers: &[(NodeId, Vec<U256>)],
) -> Result<Vec<U256>, ConsistencyFailure> {
    if answers.is_empty() {
        return Err(ConsistencyFailure::NoAnswers);
    }

    let mut majority = Vec::with_capacity(participants.len());
    for (i, account) in participants.iter().enumerate() {
        let mut votes: Vec<(U256, usize)> = Vec::new();
        for (_, balances) in answers {
            match votes.iter_mut().find(|(value, _)| *value == balances[i]) {
                Some((_, count)) => *count += 1,
                None => votes.push((balances[i], 1)),
            }
        }
        let top = votes.iter().map(|(_, c)| *c).max().unwrap_or(0);
        let winner = votes.iter().find(|(_, c)| *c == top).map(|(v, _)| *v).unwrap_or_default();

        if let Some((node, balances)) = answers.iter().find(|(_, b)| b[i] != winner) {
            return Err(ConsistencyFailure::NodeDiverged {
                node: *node,
                account: account.name.clone(),
                majority: winner,
                observed: balances[i],
            });
        }
        majority.push(winner);
    }
    Ok(majority)
}

/// Checks agreed balances against the transfer arithmetic and supply conservation.
pub fn check_round(
    participants: &[Account],
    before: &[U256],
    expected: &[U256],
    observed: &[U256],
    fees: U256,
) -> Result<(), ConsistencyFailure> {
    for ((account, expected), observed) in participants.iter().zip(expected).zip(observed) {
        if expected != observed {
            return Err(ConsistencyFailure::UnexpectedBalance {
                account: account.name.clone(),
                expected: *expected,
                observed: *observed,
            });
        }
    }

    let before_sum = before.iter().fold(U256::ZERO, |acc, b| acc + *b);
    let after_sum = observed.iter().fold(U256::ZERO, |acc, b| acc + *b);
    if after_sum + fees != before_sum {
        return Err(ConsistencyFailure::SupplyNotConserved { before: before_sum, after: after_sum, fees });
    }
    Ok(())
}

/// Totals over all rounds of one validation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpreadReport {
    pub rounds: usize,
    pub transfers: usize,
    pub fees: U256,
}

pub struct FundSpreadValidator {
    rng: StdRng,
    ledger: LedgerSettings,
    retry: RetrySettings,
    sync: SyncSettings,
}

impl FundSpreadValidator {
    pub fn new(seed: u64, ledger: LedgerSettings, retry: RetrySettings, sync: SyncSettings) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), ledger, retry, sync }
    }

    /// Runs `rounds` transfer rounds and validates the cluster after each one.
    pub async fn spread_funds_and_validate<S, W>(
        &mut self,
        supervisor: &S,
        wallet: &W,
        barrier: &SyncBarrier,
        nodes: &mut NodeSet,
        participants: &[Account],
        rounds: usize,
    ) -> ScenarioResult<SpreadReport>
    where
        S: NodeSupervisor + ?Sized,
        W: WalletService + ?Sized,
    {
        // A node that only just rejoined may still lag the blocks of earlier steps.
        let known_height = nodes.iter().filter(|n| n.is_live()).filter_map(|n| n.last_height).max();
        if let Some(height) = known_height {
            self.wait_for_inclusion(supervisor, barrier, nodes, height).await?;
        }

        let mut balances = self.read_balances(supervisor, nodes, participants).await?;
        let mut report = SpreadReport::default();
        info!(rounds, participants = participants.len(), "spreading funds");

        for round in 1..=rounds {
            let plan = plan_round(&mut self.rng, &balances, self.ledger.max_fee());
            let running = nodes.running();

            let mut submitted = Vec::with_capacity(plan.len());
            for edge in &plan {
                let hash = self
                    .submit_transfer(supervisor, wallet, &running, &participants[edge.from], &participants[edge.to], edge.value)
                    .await?;
                submitted.push((edge, hash));
            }

            let mut expected = balances.clone();
            let mut fees = U256::ZERO;
            let mut inclusion_height = 0;
            for (edge, hash) in &submitted {
                let receipt = self.await_receipt(supervisor, &running, *hash).await?;
                if !receipt.success {
                    return Err(ScenarioError::Transfer { hash: *hash, reason: "reverted".into() });
                }
                expected[edge.from] -= edge.value + receipt.fee;
                expected[edge.to] += edge.value;
                fees += receipt.fee;
                inclusion_height = inclusion_height.max(receipt.block_height);
            }

            self.wait_for_inclusion(supervisor, barrier, nodes, inclusion_height).await?;

            let observed = self.read_balances(supervisor, nodes, participants).await?;
            check_round(participants, &balances, &expected, &observed, fees)?;

            counter!("restart_scenario_transfers_total").increment(submitted.len() as u64);
            debug!(round, transfers = submitted.len(), %fees, inclusion_height, "round validated");
            report.rounds += 1;
            report.transfers += submitted.len();
            report.fees += fees;
            balances = observed;
        }

        info!(rounds = report.rounds, transfers = report.transfers, fees = %report.fees, "fund spread validated");
        Ok(report)
    }

    async fn wait_for_inclusion<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        barrier: &SyncBarrier,
        nodes: &mut NodeSet,
        height: u64,
    ) -> ScenarioResult<()> {
        if barrier.wait_for_height(supervisor, nodes, height, self.sync.sync_timeout).await? {
            return Ok(());
        }
        Err(ScenarioError::SyncTimeout {
            timeout_secs: self.sync.sync_timeout.as_secs(),
            heights: nodes.height_summary(),
        })
    }

    /// Reads every participant balance from every running node and returns the
    /// agreed values. Nodes that do not answer are retried; a node that never
    /// answers fails the check.
    async fn read_balances<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        nodes: &NodeSet,
        participants: &[Account],
    ) -> ScenarioResult<Vec<U256>> {
        let mut pending = nodes.running();
        let mut answers = BTreeMap::new();
        let attempts = self.retry.submit_attempts.max(1);

        for attempt in 1..=attempts {
            let queries = pending.iter().map(|&node| async move {
                let balances = async {
                    let mut balances = Vec::with_capacity(participants.len());
                    for account in participants {
                        balances.push(supervisor.query_account(node, account.address).await?.balance);
                    }
                    Ok::<_, SupervisorError>(balances)
                };
                (node, timeout(self.sync.query_timeout, balances).await)
            });

            for (node, result) in join_all(queries).await {
                match result {
                    Ok(Ok(balances)) => {
                        answers.insert(node, balances);
                    }
                    Ok(Err(e)) => debug!(%node, attempt, error = %e, "balance query failed"),
                    Err(_) => debug!(%node, attempt, "balance query timed out"),
                }
            }
            pending.retain(|node| !answers.contains_key(node));
            if pending.is_empty() {
                break;
            }
            sleep(self.retry.retry_interval).await;
        }
        if let Some(&node) = pending.first() {
            warn!(?pending, attempts, "running nodes did not answer balance queries");
            return Err(ConsistencyFailure::NodeUnresponsive { node, attempts }.into());
        }

        let answers: Vec<(NodeId, Vec<U256>)> = answers.into_iter().collect();
        check_consistency(participants, &answers).map_err(ScenarioError::from)
    }

    /// Submits one transfer, re-reading the nonce and re-signing after every
    /// failed attempt. Attempts rotate over the running nodes.
    async fn submit_transfer<S, W>(
        &self,
        supervisor: &S,
        wallet: &W,
        running: &[NodeId],
        from: &Account,
        to: &Account,
        value: U256,
    ) -> ScenarioResult<B256>
    where
        S: NodeSupervisor + ?Sized,
        W: WalletService + ?Sized,
    {
        let mut last = (B256::ZERO, String::from("no running node"));
        for attempt in 0..self.retry.submit_attempts.max(1) as usize {
            let Some(&node) = running.get(attempt % running.len().max(1)) else {
                break;
            };
            let nonce = match query_any(supervisor, running, from.address).await {
                Ok(state) => state.nonce,
                Err(e) => {
                    last.1 = e.to_string();
                    sleep(self.retry.retry_interval).await;
                    continue;
                }
            };

            let signed = wallet.sign(Transfer::new(&self.ledger, from.address, to.address, value, nonce))?;
            match supervisor.submit(node, &signed).await {
                Ok(hash) => {
                    debug!(from = %from.name, to = %to.name, %value, nonce, %hash, "transfer submitted");
                    return Ok(hash);
                }
                Err(e) => {
                    warn!(%node, from = %from.name, attempt = attempt + 1, error = %e, "transfer not accepted, retrying");
                    last = (signed.hash, e.to_string());
                    sleep(self.retry.retry_interval).await;
                }
            }
        }
        Err(ScenarioError::Transfer { hash: last.0, reason: last.1 })
    }

    async fn await_receipt<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        running: &[NodeId],
        hash: B256,
    ) -> ScenarioResult<TxReceipt> {
        let deadline = Instant::now() + self.retry.inclusion_timeout;
        loop {
            for &node in running {
                match supervisor.receipt(node, hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => {}
                    Err(e) => debug!(%node, %hash, error = %e, "receipt query failed"),
                }
            }
            if Instant::now() >= deadline {
                return Err(ScenarioError::Transfer {
                    hash,
                    reason: format!("not included within {}s", self.retry.inclusion_timeout.as_secs()),
                });
            }
            sleep(self.retry.retry_interval).await;
        }
    }
}
