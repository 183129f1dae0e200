use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MILESTONE_THRESHOLDS: [f64; 5] =
    [50_000.0, 100_000.0, 250_000.0, 500_000.0, 1_000_000.0];
pub const DEFAULT_MILESTONE_HORIZON_YEARS: i32 = 25;
pub const DEFAULT_CHART_HORIZON_YEARS: i32 = 20;

const MONTH_ABBREVIATIONS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// A calendar month, ordered chronologically. Text form is `YYYY-MM`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Reads the local wall clock. Only the shell calls this; the engine takes
    /// its anchor as a parameter.
    pub fn current() -> Self {
        Self::from_date(Local::now().date_naive())
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }

    pub fn add_months(self, months: i32) -> Self {
        let index = self.year * 12 + (self.month as i32 - 1) + months;
        Self {
            year: index.div_euclid(12),
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// Short display label, e.g. `Jan 2027`.
    pub fn label(self) -> String {
        format!(
            "{} {}",
            MONTH_ABBREVIATIONS[(self.month - 1) as usize],
            self.year
        )
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid year-month {0:?}, expected YYYY-MM or YYYY-MM-DD")]
pub struct ParseYearMonthError(String);

impl FromStr for YearMonth {
    type Err = ParseYearMonthError;

    /// Accepts `YYYY-MM` and full `YYYY-MM-DD` dates; the day is validated and
    /// then dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseYearMonthError(s.to_string());
        let parts: Vec<&str> = s.trim().split('-').collect();
        if !(2..=3).contains(&parts.len()) || parts[0].len() != 4 || parts[1].len() != 2 {
            return Err(invalid());
        }

        let year = parts[0].parse::<i32>().map_err(|_| invalid())?;
        let month = parts[1].parse::<u32>().map_err(|_| invalid())?;
        if let Some(day) = parts.get(2) {
            let day = day.parse::<u32>().map_err(|_| invalid())?;
            NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
        }
        Self::new(year, month).ok_or_else(invalid)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = ParseYearMonthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionChange {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "date")]
    pub effective_date: YearMonth,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionPoint {
    pub period: YearMonth,
    pub label: String,
    pub value: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MilestoneOrigin {
    System,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: String,
    pub date: String,
    pub description: String,
    pub origin: MilestoneOrigin,
}

#[derive(Debug, Clone)]
pub struct ProjectionInputs {
    pub present_value: f64,
    pub monthly_contribution: f64,
    pub annual_return_rate_percent: f64,
    pub horizon_years: i32,
    pub contribution_changes: Vec<ContributionChange>,
}

#[derive(Debug, Clone)]
pub struct MilestoneInputs {
    pub current_positive_investment_total: f64,
    pub monthly_contribution: f64,
    pub annual_return_rate_percent: f64,
    pub contribution_changes: Vec<ContributionChange>,
    pub thresholds: Vec<f64>,
    pub horizon_years: i32,
}

impl MilestoneInputs {
    pub fn with_defaults(
        current_positive_investment_total: f64,
        monthly_contribution: f64,
        annual_return_rate_percent: f64,
        contribution_changes: Vec<ContributionChange>,
    ) -> Self {
        Self {
            current_positive_investment_total,
            monthly_contribution,
            annual_return_rate_percent,
            contribution_changes,
            thresholds: DEFAULT_MILESTONE_THRESHOLDS.to_vec(),
            horizon_years: DEFAULT_MILESTONE_HORIZON_YEARS,
        }
    }
}
