mod engine;
mod ledger;
mod types;

pub use engine::{derive_system_milestones, merge_milestones, parse_milestone_date, project};
pub use ledger::{
    Account, AccountKind, EmergencyFund, EmergencyFundProgress, InvestmentSettings, Ledger,
    LedgerError, NetWorthEntry,
};
pub use types::{
    ContributionChange, DEFAULT_CHART_HORIZON_YEARS, DEFAULT_MILESTONE_HORIZON_YEARS,
    DEFAULT_MILESTONE_THRESHOLDS, Milestone, MilestoneInputs, MilestoneOrigin,
    ParseYearMonthError, ProjectionInputs, ProjectionPoint, YearMonth,
};
