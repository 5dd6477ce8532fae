//! Observable fetcher state per tenant.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mail::Account;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub email: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Envelopes listed in the last run.
    pub fetched: usize,
    /// Envelopes routed without error in the last run.
    pub processed: usize,
    pub failed: usize,
}

/// `active` means the periodic loop is enabled; `running` means a cycle is
/// executing right now. The two are independent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetcherStatus {
    pub active: bool,
    pub running: bool,
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    pub last_cycle_finished_at: Option<DateTime<Utc>>,
    pub next_cycle_at: Option<DateTime<Utc>>,
    pub accounts: Vec<AccountStatus>,
}

impl FetcherStatus {
    /// Status slot for an account, created on first use.
    pub fn account_mut(&mut self, account: &Account) -> &mut AccountStatus {
        let index = match self
            .accounts
            .iter()
            .position(|a| a.account_id == account.id)
        {
            Some(index) => index,
            None => {
                self.accounts.push(AccountStatus {
                    account_id: account.id.clone(),
                    email: account.email.clone(),
                    ..Default::default()
                });
                self.accounts.len() - 1
            }
        };
        let status = &mut self.accounts[index];
        status.email.clone_from(&account.email);
        status
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountStatus> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }
}

/// Totals for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub accounts: usize,
    pub failed_accounts: usize,
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    /// Another cycle for the tenant was already in flight.
    Skipped,
}
