//! On-chain account creation for scenario participants.

use alloy_primitives::{Address, B256};
use metrics::counter;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{LedgerSettings, RetrySettings};
use crate::error::{ScenarioError, ScenarioResult, SupervisorError, WalletError};
use crate::ledger::{Account, AccountState, SignedTransfer, Transfer, deterministic_key};
use crate::node::{NodeId, NodeSet};
use crate::supervisor::NodeSupervisor;
use crate::wallet::WalletService;

/// Name of the account funded in genesis that pays for every new account.
pub const CREATOR_ACCOUNT: &str = "genesis";

/// Imports the deterministic key of every named account into `wallet`.
pub fn import_accounts<W: WalletService + ?Sized>(
    wallet: &mut W,
    names: &[String],
) -> Result<Vec<Account>, WalletError> {
    names
        .iter()
        .map(|name| {
            let address = wallet.import_key(name, deterministic_key(name))?;
            Ok(Account { name: name.clone(), owner: name.clone(), address })
        })
        .collect()
}

/// Reads `address` from the first running node that answers.
pub(crate) async fn query_any<S: NodeSupervisor + ?Sized>(
    supervisor: &S,
    nodes: &[NodeId],
    address: Address,
) -> Result<AccountState, SupervisorError> {
    let mut last_err = None;
    for &node in nodes {
        match supervisor.query_account(node, address).await {
            Ok(state) => return Ok(state),
            Err(e) if e.is_transient() => {
                debug!(%node, error = %e, "account query failed, trying next node");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(SupervisorError::Rpc { node: NodeId(0), message: "no running node".into() }))
}

/// Creates participant accounts by funding them from the creator.
pub struct AccountProvisioner {
    ledger: LedgerSettings,
    retry: RetrySettings,
}

impl AccountProvisioner {
    pub fn new(ledger: LedgerSettings, retry: RetrySettings) -> Self {
        Self { ledger, retry }
    }

    /// Ensures every participant exists on-chain and returns how many were
    /// created. Accounts that already exist are left untouched, so running it
    /// twice creates nothing the second time.
    pub async fn create_accounts<S, W>(
        &self,
        supervisor: &S,
        wallet: &W,
        nodes: &NodeSet,
        creator: &Account,
        participants: &[Account],
    ) -> ScenarioResult<usize>
    where
        S: NodeSupervisor + ?Sized,
        W: WalletService + ?Sized,
    {
        let running = nodes.running();
        let creation_error = |account: &Account, reason: String| ScenarioError::AccountCreation {
            account: account.name.clone(),
            reason,
        };

        let mut missing = Vec::new();
        for account in participants {
            let state = query_any(supervisor, &running, account.address)
                .await
                .map_err(|e| creation_error(account, e.to_string()))?;
            if state.exists() {
                debug!(account = %account.name, balance = %state.balance, "account already exists");
            } else {
                missing.push(account);
            }
        }
        if missing.is_empty() {
            info!(accounts = participants.len(), "all accounts already exist");
            return Ok(0);
        }

        let mut nonce = query_any(supervisor, &running, creator.address)
            .await
            .map_err(|e| creation_error(creator, e.to_string()))?
            .nonce;

        for account in &missing {
            let transfer = Transfer::new(
                &self.ledger,
                creator.address,
                account.address,
                self.ledger.account_stake,
                nonce,
            );
            let signed = wallet.sign(transfer)?;
            let hash = self.submit_any(supervisor, &running, account, &signed).await?;
            counter!("restart_scenario_accounts_created_total").increment(1);
            info!(account = %account.name, address = %account.address, %hash, "account creation submitted");
            nonce += 1;
        }

        for account in &missing {
            self.confirm_exists(supervisor, &running, account).await?;
        }
        info!(created = missing.len(), "accounts provisioned");
        Ok(missing.len())
    }

    /// Submits to the first node that accepts. Transport failures move on to
    /// the next node; a ledger rejection is final.
    async fn submit_any<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        nodes: &[NodeId],
        account: &Account,
        tx: &SignedTransfer,
    ) -> ScenarioResult<B256> {
        let mut last_err = String::from("no running node");
        for &node in nodes {
            match supervisor.submit(node, tx).await {
                Ok(hash) => return Ok(hash),
                Err(e) if e.is_transient() => {
                    warn!(%node, account = %account.name, error = %e, "submission failed, trying next node");
                    last_err = e.to_string();
                }
                Err(e) => {
                    return Err(ScenarioError::AccountCreation {
                        account: account.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Err(ScenarioError::AccountCreation { account: account.name.clone(), reason: last_err })
    }

    async fn confirm_exists<S: NodeSupervisor + ?Sized>(
        &self,
        supervisor: &S,
        nodes: &[NodeId],
        account: &Account,
    ) -> ScenarioResult<()> {
        for attempt in 1..=self.retry.account_confirm_attempts {
            match query_any(supervisor, nodes, account.address).await {
                Ok(state) if state.exists() => {
                    debug!(account = %account.name, attempt, "account visible");
                    return Ok(());
                }
                Ok(_) => debug!(account = %account.name, attempt, "account not visible yet"),
                Err(e) => debug!(account = %account.name, attempt, error = %e, "existence check failed"),
            }
            sleep(self.retry.retry_interval).await;
        }
        Err(ScenarioError::AccountCreation {
            account: account.name.clone(),
            reason: format!("not visible after {} attempts", self.retry.account_confirm_attempts),
        })
    }
}
