use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::engine::{derive_system_milestones, merge_milestones, parse_milestone_date, project};
use super::types::{
    ContributionChange, DEFAULT_CHART_HORIZON_YEARS, Milestone, MilestoneInputs, MilestoneOrigin,
    ProjectionInputs, ProjectionPoint, YearMonth,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Bank,
    Credit,
    Investment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interest: Option<String>,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetWorthEntry {
    pub date: YearMonth,
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentSettings {
    pub monthly_contribution: f64,
    pub annual_return_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyFund {
    pub account_id: Option<String>,
    pub goal: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyFundProgress {
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub current: f64,
    pub goal: f64,
    pub percentage: f64,
    pub display_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("no {kind:?} account with id {id:?}")]
    UnknownAccount { kind: AccountKind, id: String },
    #[error("no contribution change with id {0:?}")]
    UnknownContributionChange(String),
    #[error("no custom milestone with id {0:?}")]
    UnknownMilestone(String),
    #[error("unrecognised date {0:?}")]
    InvalidDate(String),
    #[error("account name must not be empty")]
    EmptyName,
    #[error("milestone description must not be empty")]
    EmptyDescription,
    #[error("{0} must be a finite number")]
    NonFiniteAmount(&'static str),
    #[error("emergency fund goal must be > 0")]
    InvalidGoal,
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::UnknownAccount { .. }
                | LedgerError::UnknownContributionChange(_)
                | LedgerError::UnknownMilestone(_)
        )
    }
}

/// Session state behind the dashboard. Commands validate their arguments and
/// mutate in place; derived figures are recomputed on every read.
#[derive(Debug, Clone)]
pub struct Ledger {
    bank_accounts: Vec<Account>,
    credit_cards: Vec<Account>,
    investments: Vec<Account>,
    net_worth_history: Vec<(YearMonth, f64)>,
    emergency_fund: EmergencyFund,
    settings: InvestmentSettings,
    contribution_changes: Vec<ContributionChange>,
    custom_milestones: Vec<Milestone>,
    next_id: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            bank_accounts: Vec::new(),
            credit_cards: Vec::new(),
            investments: Vec::new(),
            net_worth_history: Vec::new(),
            emergency_fund: EmergencyFund {
                account_id: None,
                goal: 20_000.0,
            },
            settings: InvestmentSettings {
                monthly_contribution: 500.0,
                annual_return_rate: 7.0,
            },
            contribution_changes: Vec::new(),
            custom_milestones: Vec::new(),
            next_id: 1,
        }
    }

    /// The starter data a fresh dashboard opens with.
    pub fn with_demo_data() -> Self {
        let account = |id: &str, name: &str, interest: Option<&str>, balance: f64| Account {
            id: id.to_string(),
            name: name.to_string(),
            interest: interest.map(str::to_string),
            balance,
        };
        let month = |year, month| YearMonth::new(year, month).expect("valid demo month");
        let milestone = |id: &str, date: &str, description: &str| Milestone {
            id: id.to_string(),
            date: date.to_string(),
            description: description.to_string(),
            origin: MilestoneOrigin::Custom,
        };

        Self {
            bank_accounts: vec![
                account("1", "Bank of America Checking", Some("0.03% APY"), 5_000.0),
                account("2", "Bank of America Saving", Some("2.2% APY"), 16_000.0),
            ],
            credit_cards: vec![
                account("1", "Chase Saphire", None, 1_500.0),
                account("2", "Wells Fargo Card", None, 1_000.0),
            ],
            investments: vec![
                account("1", "Fidelity account(401k)", None, 5_000.0),
                account("2", "House equity", None, 20_000.0),
                account("3", "Home loan", None, -30_000.0),
            ],
            net_worth_history: vec![
                (month(2024, 11), 5_000.0),
                (month(2024, 12), 7_000.0),
                (month(2025, 1), 6_500.0),
                (month(2025, 2), 8_000.0),
                (month(2025, 3), 12_000.0),
            ],
            emergency_fund: EmergencyFund {
                account_id: Some("2".to_string()),
                goal: 20_000.0,
            },
            contribution_changes: vec![ContributionChange {
                id: "1".to_string(),
                effective_date: month(2026, 1),
                amount: 700.0,
            }],
            custom_milestones: vec![
                milestone("1", "Dec 2026", "House paid"),
                milestone("3", "2028", "Expected promotion"),
                milestone("5", "2045", "Retirement"),
            ],
            next_id: 6,
            ..Self::new()
        }
    }

    fn allocate_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    pub fn accounts(&self, kind: AccountKind) -> &[Account] {
        match kind {
            AccountKind::Bank => &self.bank_accounts,
            AccountKind::Credit => &self.credit_cards,
            AccountKind::Investment => &self.investments,
        }
    }

    fn accounts_mut(&mut self, kind: AccountKind) -> &mut Vec<Account> {
        match kind {
            AccountKind::Bank => &mut self.bank_accounts,
            AccountKind::Credit => &mut self.credit_cards,
            AccountKind::Investment => &mut self.investments,
        }
    }

    /// Adds an account and refreshes this month's net-worth entry. Interest
    /// text is only kept for bank accounts.
    pub fn add_account(
        &mut self,
        kind: AccountKind,
        name: &str,
        balance: f64,
        interest: Option<&str>,
        today: YearMonth,
    ) -> Result<Account, LedgerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::EmptyName);
        }
        ensure_finite("balance", balance)?;

        let interest = match kind {
            AccountKind::Bank => interest
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string),
            AccountKind::Credit | AccountKind::Investment => None,
        };
        let account = Account {
            id: self.allocate_id(),
            name: name.to_string(),
            interest,
            balance,
        };
        self.accounts_mut(kind).push(account.clone());
        if let Err(err) = self.refresh_net_worth(today) {
            self.accounts_mut(kind).pop();
            return Err(err);
        }
        info!(?kind, id = %account.id, balance, "account added");
        Ok(account)
    }

    pub fn update_balance(
        &mut self,
        kind: AccountKind,
        id: &str,
        balance: f64,
        today: YearMonth,
    ) -> Result<(), LedgerError> {
        ensure_finite("balance", balance)?;
        let account = self
            .accounts_mut(kind)
            .iter_mut()
            .find(|account| account.id == id)
            .ok_or_else(|| LedgerError::UnknownAccount {
                kind,
                id: id.to_string(),
            })?;
        let previous = std::mem::replace(&mut account.balance, balance);
        if let Err(err) = self.refresh_net_worth(today) {
            if let Some(account) = self
                .accounts_mut(kind)
                .iter_mut()
                .find(|account| account.id == id)
            {
                account.balance = previous;
            }
            return Err(err);
        }
        info!(?kind, id, balance, "balance updated");
        Ok(())
    }

    pub fn delete_account(
        &mut self,
        kind: AccountKind,
        id: &str,
        today: YearMonth,
    ) -> Result<Account, LedgerError> {
        let accounts = self.accounts_mut(kind);
        let index = accounts
            .iter()
            .position(|account| account.id == id)
            .ok_or_else(|| LedgerError::UnknownAccount {
                kind,
                id: id.to_string(),
            })?;
        let removed = accounts.remove(index);
        if let Err(err) = self.refresh_net_worth(today) {
            self.accounts_mut(kind).insert(index, removed);
            return Err(err);
        }
        info!(?kind, id, "account deleted");
        Ok(removed)
    }

    /// Bank balances minus card balances plus investments. Investment
    /// balances may be negative, e.g. a loan.
    pub fn net_worth(&self) -> f64 {
        let bank: f64 = self.bank_accounts.iter().map(|a| a.balance).sum();
        let credit: f64 = self.credit_cards.iter().map(|a| a.balance).sum();
        let investment: f64 = self.investments.iter().map(|a| a.balance).sum();
        bank - credit + investment
    }

    pub fn positive_investment_total(&self) -> f64 {
        self.investments
            .iter()
            .map(|a| a.balance)
            .filter(|&balance| balance > 0.0)
            .sum()
    }

    /// Inserts or replaces the history entry for `date`.
    pub fn record_net_worth(&mut self, date: YearMonth, value: f64) -> Result<(), LedgerError> {
        ensure_finite("value", value)?;
        match self
            .net_worth_history
            .iter_mut()
            .find(|(month, _)| *month == date)
        {
            Some(entry) => entry.1 = value,
            None => self.net_worth_history.push((date, value)),
        }
        info!(%date, value, "net worth recorded");
        Ok(())
    }

    /// Writes the live net worth into the `today` history entry. Fails without
    /// touching the history when the balances no longer sum to a finite value.
    pub fn refresh_net_worth(&mut self, today: YearMonth) -> Result<(), LedgerError> {
        let value = self.net_worth();
        ensure_finite("net worth", value)?;
        self.record_net_worth(today, value)
    }

    pub fn net_worth_history(&self) -> Vec<NetWorthEntry> {
        let mut history: Vec<NetWorthEntry> = self
            .net_worth_history
            .iter()
            .map(|&(date, value)| NetWorthEntry {
                date,
                label: date.label(),
                value,
            })
            .collect();
        history.sort_by_key(|entry| entry.date);
        history
    }

    pub fn emergency_fund(&self) -> &EmergencyFund {
        &self.emergency_fund
    }

    /// Points the emergency fund at a bank account and sets its goal.
    pub fn set_emergency_fund(&mut self, account_id: &str, goal: f64) -> Result<(), LedgerError> {
        if !goal.is_finite() || goal <= 0.0 {
            return Err(LedgerError::InvalidGoal);
        }
        if !self.bank_accounts.iter().any(|a| a.id == account_id) {
            return Err(LedgerError::UnknownAccount {
                kind: AccountKind::Bank,
                id: account_id.to_string(),
            });
        }
        self.emergency_fund = EmergencyFund {
            account_id: Some(account_id.to_string()),
            goal,
        };
        info!(account_id, goal, "emergency fund updated");
        Ok(())
    }

    pub fn emergency_fund_progress(&self) -> EmergencyFundProgress {
        let account = self
            .emergency_fund
            .account_id
            .as_deref()
            .and_then(|id| self.bank_accounts.iter().find(|a| a.id == id));
        let current = account.map_or(0.0, |a| a.balance);
        let goal = self.emergency_fund.goal;
        let percentage = current / goal * 100.0;

        EmergencyFundProgress {
            account_id: self.emergency_fund.account_id.clone(),
            account_name: account.map(|a| a.name.clone()),
            current,
            goal,
            percentage,
            display_percentage: percentage.min(100.0),
        }
    }

    pub fn settings(&self) -> InvestmentSettings {
        self.settings
    }

    pub fn set_investment_settings(
        &mut self,
        monthly_contribution: f64,
        annual_return_rate: f64,
    ) -> Result<(), LedgerError> {
        ensure_finite("monthlyContribution", monthly_contribution)?;
        ensure_finite("annualReturnRate", annual_return_rate)?;
        self.settings = InvestmentSettings {
            monthly_contribution,
            annual_return_rate,
        };
        info!(monthly_contribution, annual_return_rate, "investment settings updated");
        Ok(())
    }

    pub fn contribution_changes(&self) -> &[ContributionChange] {
        &self.contribution_changes
    }

    pub fn add_contribution_change(
        &mut self,
        effective_date: YearMonth,
        amount: f64,
    ) -> Result<ContributionChange, LedgerError> {
        ensure_finite("amount", amount)?;
        let change = ContributionChange {
            id: self.allocate_id(),
            effective_date,
            amount,
        };
        self.contribution_changes.push(change.clone());
        info!(id = %change.id, %effective_date, amount, "contribution change added");
        Ok(change)
    }

    pub fn delete_contribution_change(
        &mut self,
        id: &str,
    ) -> Result<ContributionChange, LedgerError> {
        let index = self
            .contribution_changes
            .iter()
            .position(|change| change.id == id)
            .ok_or_else(|| LedgerError::UnknownContributionChange(id.to_string()))?;
        info!(id, "contribution change deleted");
        Ok(self.contribution_changes.remove(index))
    }

    pub fn custom_milestones(&self) -> &[Milestone] {
        &self.custom_milestones
    }

    /// Adds a user milestone. The date may be any form the timeline parses and
    /// is stored as a `Mon YYYY` label.
    pub fn add_milestone(&mut self, date: &str, description: &str) -> Result<Milestone, LedgerError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(LedgerError::EmptyDescription);
        }
        let month =
            parse_milestone_date(date).ok_or_else(|| LedgerError::InvalidDate(date.to_string()))?;

        let milestone = Milestone {
            id: self.allocate_id(),
            date: month.label(),
            description: description.to_string(),
            origin: MilestoneOrigin::Custom,
        };
        self.custom_milestones.push(milestone.clone());
        info!(id = %milestone.id, date = %milestone.date, "milestone added");
        Ok(milestone)
    }

    pub fn delete_milestone(&mut self, id: &str) -> Result<Milestone, LedgerError> {
        let index = self
            .custom_milestones
            .iter()
            .position(|milestone| milestone.id == id)
            .ok_or_else(|| LedgerError::UnknownMilestone(id.to_string()))?;
        info!(id, "milestone deleted");
        Ok(self.custom_milestones.remove(index))
    }

    /// Growth chart series from the positive investment total.
    pub fn projection(&self, anchor: YearMonth) -> Vec<ProjectionPoint> {
        project(
            &ProjectionInputs {
                present_value: self.positive_investment_total(),
                monthly_contribution: self.settings.monthly_contribution,
                annual_return_rate_percent: self.settings.annual_return_rate,
                horizon_years: DEFAULT_CHART_HORIZON_YEARS,
                contribution_changes: self.contribution_changes.clone(),
            },
            anchor,
        )
    }

    pub fn system_milestones(&self, anchor: YearMonth) -> Vec<Milestone> {
        derive_system_milestones(
            &MilestoneInputs::with_defaults(
                self.positive_investment_total(),
                self.settings.monthly_contribution,
                self.settings.annual_return_rate,
                self.contribution_changes.clone(),
            ),
            anchor,
        )
    }

    /// Custom and derived milestones on one timeline.
    pub fn all_milestones(&self, anchor: YearMonth) -> Vec<Milestone> {
        merge_milestones(&self.custom_milestones, &self.system_milestones(anchor))
    }
}

fn ensure_finite(field: &'static str, value: f64) -> Result<(), LedgerError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(LedgerError::NonFiniteAmount(field))
    }
}
