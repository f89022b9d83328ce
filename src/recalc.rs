//! Cache recalculation
//!
//! Brings the progress cache of a changed node and every ancestor up to
//! date, strictly bottom-up, one transactional upsert per node. Each write
//! re-reads the node's children immediately before computing - never from a
//! snapshot taken before the triggering change - and carries the row version
//! it read so a concurrent writer surfaces as a retryable stale signal
//! instead of interleaving into a partially-written row. A failure at an
//! ancestor leaves already-written descendant rows intact.

use crate::db::{self, CacheWrite, Database, DbError, KpiLevel, KpiNode, ProgressCache, Result};
use crate::formula::{self, AtRiskPolicy, CalculationMethod, ChildProgress, Formula, ManualOverride, ProgressStatus};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::collections::HashSet;

/// Bounded retries for stale cache writes before surfacing the failure
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Result of a completion log trigger, for UI optimistic-update reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct LogOutcome {
    pub cache: ProgressCache,
    pub ancestors_updated: Vec<i32>,
}

/// Walks ancestor chains and keeps the progress cache consistent
pub struct Recalculator<'a> {
    db: &'a Database,
    policy: AtRiskPolicy,
}

impl<'a> Recalculator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            policy: AtRiskPolicy::default(),
        }
    }

    pub fn with_policy(db: &'a Database, policy: AtRiskPolicy) -> Self {
        Self { db, policy }
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    /// Record a completion and propagate it up the ancestor chain
    pub fn log_completion(
        &self,
        kpi_id: i32,
        date: NaiveDate,
        completed: bool,
        value: Option<f64>,
    ) -> Result<LogOutcome> {
        let node = self.active_kpi(kpi_id)?;
        self.db.upsert_completion_log(node.id, date, completed, value)?;

        let ancestors_updated = self.recalculate(kpi_id)?;
        let cache = self.db.get_cache(kpi_id)?.ok_or_else(|| {
            DbError::NotFound(format!("no cache row for KPI {} after recalculation", kpi_id))
        })?;

        Ok(LogOutcome {
            cache,
            ancestors_updated,
        })
    }

    /// Pin a node's percentage, bypassing the rollup until cleared.
    /// The node's parent chain is recalculated with the pinned value.
    pub fn set_manual_override(&self, kpi_id: i32, percentage: f64, reason: &str) -> Result<Vec<i32>> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(DbError::Validation(format!(
                "override percentage must be between 0 and 100, got {}",
                percentage
            )));
        }
        let node = self.active_kpi(kpi_id)?;
        let today = Local::now().date_naive();

        let manual = ManualOverride {
            percentage,
            reason: reason.to_string(),
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let existing = self.db.get_cache(kpi_id)?;
            let children = self.db.active_children_with_cache(kpi_id)?;
            let formula = formula::compute(&[], Some(&manual));
            let status = formula::derive_status(
                percentage,
                percentage > 0.0,
                node_period(&node),
                today,
                &self.policy,
            );
            let write = CacheWrite {
                kpi_id,
                progress_percentage: formula.result_percentage,
                status: status.as_str().to_string(),
                child_count: children.len() as i32,
                completed_child_count: completed_count(&children),
                calculation_method: formula.method.as_str().to_string(),
                manual_override_reason: Some(reason.to_string()),
                formula_json: serde_json::to_string(&formula).ok(),
            };
            match self.db.upsert_cache(&write, existing.map(|c| c.row_version)) {
                Ok(_) => break,
                Err(e) if e.is_retryable() && attempt < MAX_WRITE_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }

        let mut updated = vec![kpi_id];
        if let Some(parent_id) = node.parent_kpi_id {
            updated = merge_updates(updated, self.recalculate_chain(parent_id, false)?);
        }
        Ok(updated)
    }

    /// Release an override and return the node to automatic calculation
    pub fn clear_manual_override(&self, kpi_id: i32) -> Result<Vec<i32>> {
        let cache = self.db.get_cache(kpi_id)?;
        let overridden = cache
            .map(|c| c.calculation_method == CalculationMethod::ManualOverride.as_str())
            .unwrap_or(false);
        if !overridden {
            return Err(DbError::Validation(format!(
                "KPI {} is not under a manual override",
                kpi_id
            )));
        }
        self.recalculate_chain(kpi_id, true)
    }

    /// Re-trigger after a structural weight edit; only ancestors change
    pub fn set_weight(&self, kpi_id: i32, weight: f64) -> Result<Vec<i32>> {
        let node = self.db.get_kpi(kpi_id)?;
        self.db.set_weight(kpi_id, weight)?;
        match node.parent_kpi_id {
            Some(parent_id) => self.recalculate_chain(parent_id, false),
            None => Ok(Vec::new()),
        }
    }

    /// Move a node under a new parent, recalculating both the old and the
    /// new ancestor chains
    pub fn reparent(&self, kpi_id: i32, new_parent_id: Option<i32>) -> Result<Vec<i32>> {
        let node = self.db.get_kpi(kpi_id)?;
        let old_parent = node.parent_kpi_id;
        self.db.reparent_kpi(kpi_id, new_parent_id)?;

        let mut updated = Vec::new();
        if let Some(old) = old_parent.filter(|old| Some(*old) != new_parent_id) {
            updated = merge_updates(updated, self.recalculate_chain(old, false)?);
        }
        if let Some(new) = new_parent_id {
            updated = merge_updates(updated, self.recalculate_chain(new, false)?);
        }
        Ok(updated)
    }

    /// Soft-delete a node and recalculate its former parent's chain as if
    /// the child no longer exists
    pub fn deactivate(&self, kpi_id: i32) -> Result<Vec<i32>> {
        let former_parent = self.db.deactivate_kpi(kpi_id)?;
        match former_parent {
            Some(parent_id) => self.recalculate_chain(parent_id, false),
            None => Ok(Vec::new()),
        }
    }

    // ========================================================================
    // Chain Walk
    // ========================================================================

    /// Recalculate a node and every ancestor, bottom-up. Returns the ids
    /// actually written, in walk order.
    pub fn recalculate(&self, kpi_id: i32) -> Result<Vec<i32>> {
        self.recalculate_chain(kpi_id, false)
    }

    fn recalculate_chain(&self, kpi_id: i32, force_first: bool) -> Result<Vec<i32>> {
        let mut updated = Vec::new();
        let mut node = self.db.get_kpi(kpi_id)?;
        let mut force = force_first;
        // Stored parent links are untrusted; never walk the same node twice
        let mut visited: HashSet<i32> = HashSet::new();

        loop {
            if !visited.insert(node.id) {
                break;
            }
            if self.recalculate_node(&node, force)? {
                updated.push(node.id);
            }
            force = false;

            let Some(parent_id) = node.parent_kpi_id else {
                break;
            };
            match self.db.get_kpi(parent_id) {
                Ok(parent) if parent.is_active => node = parent,
                Ok(_) => break,
                Err(DbError::NotFound(_)) => break, // dangling reference; chain ends here
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    /// Recalculate one node with bounded retries on stale writes.
    /// Returns false when the node is under a manual override and only its
    /// child counts were refreshed.
    fn recalculate_node(&self, node: &KpiNode, force: bool) -> Result<bool> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_recalculate_node(node, force) {
                Err(e) if e.is_retryable() && attempt < MAX_WRITE_ATTEMPTS => continue,
                other => return other,
            }
        }
    }

    fn try_recalculate_node(&self, node: &KpiNode, force: bool) -> Result<bool> {
        // The row read here anchors the compare-and-swap; children are read
        // fresh in the same pass
        let existing = self.db.get_cache(node.id)?;
        let expected_version = existing.as_ref().map(|c| c.row_version);

        let children = self.db.active_children_with_cache(node.id)?;
        let child_count = children.len() as i32;
        let completed_children = completed_count(&children);

        if !force {
            if let Some(cache) = &existing {
                if cache.calculation_method == CalculationMethod::ManualOverride.as_str() {
                    // The percentage stays the user's; counts stay honest
                    self.db
                        .update_cache_child_counts(node.id, child_count, completed_children)?;
                    return Ok(false);
                }
            }
        }

        let today = Local::now().date_naive();
        let (formula, has_progress) = if children.is_empty() {
            let formula = self.leaf_formula(node, today)?;
            let has_progress = formula.result_percentage > 0.0;
            (formula, has_progress)
        } else {
            let inputs: Vec<ChildProgress> = children
                .iter()
                .map(|r| ChildProgress {
                    kpi_id: r.node.id,
                    title: r.node.title.clone(),
                    progress: r.cache.as_ref().map(|c| c.progress_percentage).unwrap_or(0.0),
                    weight: r.node.weight,
                })
                .collect();
            let has_progress = inputs.iter().any(|c| c.progress > 0.0);
            (formula::compute(&inputs, None), has_progress)
        };

        let status = formula::derive_status(
            formula.result_percentage,
            has_progress,
            node_period(node),
            today,
            &self.policy,
        );

        let write = CacheWrite {
            kpi_id: node.id,
            progress_percentage: formula.result_percentage,
            status: status.as_str().to_string(),
            child_count,
            completed_child_count: completed_children,
            calculation_method: formula.method.as_str().to_string(),
            manual_override_reason: None,
            formula_json: serde_json::to_string(&formula).ok(),
        };
        self.db.upsert_cache(&write, expected_version)?;
        Ok(true)
    }

    /// A leaf's percentage comes from its own completion logs
    fn leaf_formula(&self, node: &KpiNode, today: NaiveDate) -> Result<Formula> {
        if let Some(target) = node.target_value.filter(|t| *t > 0.0) {
            let current = self.db.latest_value(node.id)?.unwrap_or(0.0);
            let pct = ((current / target) * 100.0).clamp(0.0, 100.0);
            return Ok(formula::direct_log(
                pct,
                &format!("from {} of {} logged", current, target),
            ));
        }

        if node.kpi_level() == KpiLevel::Daily {
            let day = node
                .target_date
                .as_deref()
                .and_then(db::parse_date)
                .unwrap_or(today);
            let done = self
                .db
                .log_on(node.id, day)?
                .map(|log| log.completed)
                .unwrap_or(false);
            let pct = if done { 100.0 } else { 0.0 };
            return Ok(formula::direct_log(pct, &format!("from log on {}", day)));
        }

        // Tracked directly without a numeric target: done once any completed
        // log lands inside the node's period
        let done = match node_period(node) {
            Some((start, end)) => self.db.completed_in_range(node.id, start, end)?,
            None => self.db.any_completed(node.id)?,
        };
        let pct = if done { 100.0 } else { 0.0 };
        Ok(formula::direct_log(pct, "from completion logs"))
    }

    fn active_kpi(&self, kpi_id: i32) -> Result<KpiNode> {
        let node = self.db.get_kpi(kpi_id)?;
        if !node.is_active {
            return Err(DbError::Validation(format!("KPI {} is deleted", kpi_id)));
        }
        Ok(node)
    }
}

fn node_period(node: &KpiNode) -> Option<(NaiveDate, NaiveDate)> {
    let start = node.period_start.as_deref().and_then(db::parse_date)?;
    let end = node.period_end.as_deref().and_then(db::parse_date)?;
    Some((start, end))
}

fn completed_count(children: &[db::KpiRecord]) -> i32 {
    children
        .iter()
        .filter(|r| {
            r.cache
                .as_ref()
                .map(|c| c.status == ProgressStatus::Completed.as_str())
                .unwrap_or(false)
        })
        .count() as i32
}

fn merge_updates(mut acc: Vec<i32>, more: Vec<i32>) -> Vec<i32> {
    for id in more {
        if !acc.contains(&id) {
            acc.push(id);
        }
    }
    acc
}
