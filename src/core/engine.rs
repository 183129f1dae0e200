use std::str::FromStr;

use chrono::Month;

use super::types::{
    ContributionChange, Milestone, MilestoneInputs, MilestoneOrigin, ProjectionInputs,
    ProjectionPoint, YearMonth,
};

const POINT_INTERVAL_MONTHS: i32 = 6;

/// Projects an investment balance month by month from `anchor`, emitting a
/// point every six simulated months.
///
/// Growth uses the nominal monthly rate `annual / 100 / 12` and the month's
/// contribution is added after growth. Scheduled contribution changes take
/// effect in the first simulated month whose calendar month is on or after
/// their effective date.
pub fn project(inputs: &ProjectionInputs, anchor: YearMonth) -> Vec<ProjectionPoint> {
    project_points(
        inputs.present_value,
        inputs.monthly_contribution,
        inputs.annual_return_rate_percent,
        inputs.horizon_years,
        &inputs.contribution_changes,
        anchor,
    )
}

fn project_points(
    present_value: f64,
    monthly_contribution: f64,
    annual_return_rate_percent: f64,
    horizon_years: i32,
    contribution_changes: &[ContributionChange],
    anchor: YearMonth,
) -> Vec<ProjectionPoint> {
    if horizon_years <= 0 {
        return Vec::new();
    }

    let mut schedule: Vec<&ContributionChange> = contribution_changes.iter().collect();
    // Stable: for equal dates the later entry is adopted last and wins.
    schedule.sort_by_key(|change| change.effective_date);
    let mut pending = schedule.into_iter().peekable();

    let monthly_rate = annual_return_rate_percent / 100.0 / 12.0;
    let total_months = horizon_years.saturating_mul(12);
    let mut total = present_value;
    let mut current_contribution = monthly_contribution;
    let mut points = Vec::new();

    for month in 1..=total_months {
        let period = anchor.add_months(month);
        while let Some(change) = pending.next_if(|change| change.effective_date <= period) {
            current_contribution = change.amount;
        }

        total = total * (1.0 + monthly_rate) + current_contribution;

        if month % POINT_INTERVAL_MONTHS == 0 {
            points.push(ProjectionPoint {
                period,
                label: period.label(),
                value: round_half_up(total),
            });
        }
    }

    points
}

/// Derives one system milestone per threshold: the first projected point at
/// or above it. Thresholds not reached within the horizon are omitted.
pub fn derive_system_milestones(inputs: &MilestoneInputs, anchor: YearMonth) -> Vec<Milestone> {
    let projection = project_points(
        inputs.current_positive_investment_total,
        inputs.monthly_contribution,
        inputs.annual_return_rate_percent,
        inputs.horizon_years,
        &inputs.contribution_changes,
        anchor,
    );

    inputs
        .thresholds
        .iter()
        .filter_map(|&threshold| {
            projection
                .iter()
                .find(|point| point.value >= threshold)
                .map(|point| Milestone {
                    id: format!("auto-{threshold}"),
                    date: point.label.clone(),
                    description: format!("${} saved", format_thousands(threshold)),
                    origin: MilestoneOrigin::System,
                })
        })
        .collect()
}

/// Concatenates custom and system milestones and sorts them by calendar date.
///
/// The sort is stable, so equal dates keep custom milestones ahead of system
/// ones and otherwise preserve input order. Dates that cannot be parsed sort
/// after all others.
pub fn merge_milestones(custom: &[Milestone], system: &[Milestone]) -> Vec<Milestone> {
    let mut merged: Vec<Milestone> = custom.iter().chain(system).cloned().collect();
    merged.sort_by_key(|milestone| {
        let parsed = parse_milestone_date(&milestone.date);
        (parsed.is_none(), parsed)
    });
    merged
}

/// Parses the date forms milestones are written in: `2028`, `2026-01`,
/// `2026-01-15`, `Dec 2026` and `March 2027`. A bare year means January.
pub fn parse_milestone_date(text: &str) -> Option<YearMonth> {
    let text = text.trim();
    if let Ok(year_month) = text.parse::<YearMonth>() {
        return Some(year_month);
    }

    if text.len() == 4 && text.bytes().all(|b| b.is_ascii_digit()) {
        return YearMonth::new(text.parse().ok()?, 1);
    }

    let mut words = text.split_whitespace();
    let (month_word, year_word) = (words.next()?, words.next()?);
    if words.next().is_some() {
        return None;
    }
    let month = Month::from_str(month_word.trim_end_matches(['.', ','])).ok()?;
    let year = year_word.parse::<i32>().ok()?;
    YearMonth::new(year, month.number_from_month())
}

/// Rounds to the nearest whole unit with halves going toward positive
/// infinity, so `-2.5` becomes `-2`.
fn round_half_up(value: f64) -> f64 {
    let rounded = value.round();
    if value - rounded == 0.5 {
        rounded + 1.0
    } else {
        rounded
    }
}

pub(crate) fn format_thousands(value: f64) -> String {
    let text = format!("{value:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text),
    };
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (unsigned, None),
    };

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    match fraction {
        Some(fraction) => format!("{sign}{grouped}.{fraction}"),
        None => format!("{sign}{grouped}"),
    }
}
