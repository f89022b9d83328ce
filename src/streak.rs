//! Streak computation over completion dates
//!
//! Current and longest consecutive-day runs are always recomputed from the
//! underlying date set - never incrementally mutated - so a backfilled or
//! corrected log immediately yields a correct streak with no drift. The
//! weekly recovery is a one-shot state machine per (KPI, ISO week): a row in
//! streak_recoveries marks the week's recovery as used, and the marker
//! resets naturally when the ISO week rolls over on Monday.

use crate::db::{self, Database, Result};
use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use std::collections::BTreeSet;

/// Whether this ISO week's recovery is still available for a KPI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    Available,
    Used,
}

/// Streak figures for one KPI, derived from its completion dates
#[derive(Debug, Clone, Serialize)]
pub struct StreakSummary {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_activity_date: Option<String>,
    pub recovery: RecoveryState,
}

/// A one-day gap that this week's recovery could bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCandidate {
    pub gap_date: NaiveDate,
    /// Run length once the gap is bridged (both runs plus the forgiven day)
    pub restored_run: u32,
}

/// The (ISO year, ISO week) pair a date falls in
pub fn iso_week_of(date: NaiveDate) -> (i32, i32) {
    let week = date.iso_week();
    (week.year(), week.week() as i32)
}

fn normalized(dates: &[NaiveDate]) -> Vec<NaiveDate> {
    let set: BTreeSet<NaiveDate> = dates.iter().copied().collect();
    set.into_iter().rev().collect()
}

/// Consecutive-day run ending today or yesterday; 0 once a full day is missed
pub fn current_streak(dates: &[NaiveDate], today: NaiveDate) -> u32 {
    let days = normalized(dates);
    let Some(first) = days.first() else {
        return 0;
    };
    if *first != today && *first != today - Duration::days(1) {
        return 0;
    }

    let mut run = 1;
    for pair in days.windows(2) {
        if pair[0] - pair[1] == Duration::days(1) {
            run += 1;
        } else {
            break;
        }
    }
    run
}

/// Longest consecutive-day run anywhere in the date set
pub fn longest_streak(dates: &[NaiveDate]) -> u32 {
    let days = normalized(dates);
    if days.is_empty() {
        return 0;
    }

    let mut best = 1;
    let mut run = 1;
    for pair in days.windows(2) {
        if pair[0] - pair[1] == Duration::days(1) {
            run += 1;
            best = best.max(run);
        } else {
            run = 1;
        }
    }
    best
}

/// Find the one-day gap directly behind the current run, if one exists.
///
/// Requires an active run (anchored today or yesterday), exactly one missed
/// day behind it, and a completed day on the far side of the miss.
pub fn recovery_candidate(dates: &[NaiveDate], today: NaiveDate) -> Option<RecoveryCandidate> {
    let days = normalized(dates);
    let current = current_streak(&days, today);
    if current == 0 {
        return None;
    }

    let newest = days[0];
    let run_start = newest - Duration::days(i64::from(current) - 1);
    let gap = run_start - Duration::days(1);
    let resumed = run_start - Duration::days(2);
    if days.contains(&gap) || !days.contains(&resumed) {
        return None;
    }

    let mut prior = 1;
    let mut cursor = resumed;
    while days.contains(&(cursor - Duration::days(1))) {
        prior += 1;
        cursor -= Duration::days(1);
    }

    Some(RecoveryCandidate {
        gap_date: gap,
        restored_run: current + prior + 1,
    })
}

/// Completion dates for a KPI with previously bridged gap days unioned in
fn bridged_dates(db: &Database, kpi_id: i32) -> Result<Vec<NaiveDate>> {
    let mut dates = db.completed_dates(kpi_id)?;
    for recovery in db.recoveries_for(kpi_id)? {
        if let Some(gap) = db::parse_date(&recovery.gap_date) {
            dates.push(gap);
        }
    }
    Ok(dates)
}

/// Streak figures for one KPI as of a given day
pub fn streak_summary(db: &Database, kpi_id: i32, today: NaiveDate) -> Result<StreakSummary> {
    db.get_kpi(kpi_id)?;

    let dates = bridged_dates(db, kpi_id)?;
    let last_activity = db.completed_dates(kpi_id)?.into_iter().max();

    let (iso_year, iso_week) = iso_week_of(today);
    let recovery = if db.recovery_for_week(kpi_id, iso_year, iso_week)?.is_some() {
        RecoveryState::Used
    } else {
        RecoveryState::Available
    };

    Ok(StreakSummary {
        current_streak: current_streak(&dates, today),
        longest_streak: longest_streak(&dates),
        last_activity_date: last_activity.map(db::date_str),
        recovery,
    })
}

/// Bridge a one-day gap, consuming this ISO week's recovery.
///
/// Succeeds only when the week's recovery is still available, the date set
/// shows exactly one missed day behind the current run, and the user logged
/// at least min_actions completions across the vision today.
pub fn attempt_recovery(
    db: &Database,
    kpi_id: i32,
    today: NaiveDate,
    min_actions: i64,
) -> Result<StreakSummary> {
    let node = db.get_kpi(kpi_id)?;

    let (iso_year, iso_week) = iso_week_of(today);
    if db.recovery_for_week(kpi_id, iso_year, iso_week)?.is_some() {
        return Err(db::DbError::Validation(format!(
            "streak recovery for KPI {} already used in week {}-W{:02}",
            kpi_id, iso_year, iso_week
        )));
    }

    let dates = bridged_dates(db, kpi_id)?;
    let candidate = recovery_candidate(&dates, today).ok_or_else(|| {
        db::DbError::Validation(format!(
            "KPI {} has no one-day gap behind an active run to recover",
            kpi_id
        ))
    })?;

    let qualifying = db.vision_completed_count_on(node.vision_id, today)?;
    if qualifying < min_actions {
        return Err(db::DbError::Validation(format!(
            "recovery needs {} qualifying completions today, found {}",
            min_actions, qualifying
        )));
    }

    db.record_recovery(kpi_id, iso_year, iso_week, candidate.gap_date, today)?;
    streak_summary(db, kpi_id, today)
}
