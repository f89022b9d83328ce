//! Forest assembly from flat KPI records
//!
//! Turns the flat node+cache join for one vision into an ordered forest via
//! parent-id linkage. Parent references are untrusted foreign-key data:
//! a dangling reference degrades to "appears as top-level" and a parent
//! cycle is broken rather than recursed into - building never fails.

use crate::db::KpiRecord;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// One node of the presentation forest, children resolved and ordered
#[derive(Debug, Clone, Serialize)]
pub struct KpiTreeNode {
    pub id: i32,
    pub change_id: String,
    pub title: String,
    pub level: String,
    pub weight: f64,
    pub sort_order: i32,
    /// Rounded for display; the cache keeps fractional precision
    pub progress: i32,
    pub status: String,
    pub calculation_method: Option<String>,
    pub last_calculated_at: Option<String>,
    pub children: Vec<KpiTreeNode>,
}

/// Build an ordered forest from the flat records of one vision.
///
/// First pass indexes by id, second pass attaches each node to its parent's
/// children list. Nodes whose parent is not in the input set are roots.
pub fn build_forest(records: &[KpiRecord]) -> Vec<KpiTreeNode> {
    let ids: HashSet<i32> = records.iter().map(|r| r.node.id).collect();

    // Parent link per node, restricted to parents present in the input
    let parents: HashMap<i32, Option<i32>> = records
        .iter()
        .map(|r| {
            let parent = r.node.parent_kpi_id.filter(|p| ids.contains(p));
            (r.node.id, parent)
        })
        .collect();

    let severed = severed_links(&parents);

    let mut children_of: HashMap<i32, Vec<i32>> = HashMap::new();
    let mut roots: Vec<i32> = Vec::new();
    for record in records {
        let id = record.node.id;
        match parents[&id] {
            Some(parent) if !severed.contains(&id) => {
                children_of.entry(parent).or_default().push(id);
            }
            _ => roots.push(id),
        }
    }

    let by_id: HashMap<i32, &KpiRecord> = records.iter().map(|r| (r.node.id, r)).collect();
    let mut forest: Vec<KpiTreeNode> = roots
        .iter()
        .map(|id| assemble(*id, &by_id, &children_of))
        .collect();
    sort_siblings(&mut forest);
    forest
}

/// Parent links to cut so the forest is cycle-free. Walking up from each
/// node, a node revisited on the current path is treated as a root.
fn severed_links(parents: &HashMap<i32, Option<i32>>) -> HashSet<i32> {
    let mut severed: HashSet<i32> = HashSet::new();
    let mut settled: HashSet<i32> = HashSet::new();

    for &start in parents.keys() {
        let mut path: Vec<i32> = Vec::new();
        let mut on_path: HashSet<i32> = HashSet::new();
        let mut cursor = start;
        loop {
            if settled.contains(&cursor) {
                break;
            }
            if !on_path.insert(cursor) {
                severed.insert(cursor);
                break;
            }
            path.push(cursor);
            let next = if severed.contains(&cursor) {
                None
            } else {
                parents.get(&cursor).copied().flatten()
            };
            match next {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        settled.extend(path);
    }

    severed
}

fn assemble(
    id: i32,
    by_id: &HashMap<i32, &KpiRecord>,
    children_of: &HashMap<i32, Vec<i32>>,
) -> KpiTreeNode {
    let record = by_id[&id];
    let children = children_of
        .get(&id)
        .map(|kids| kids.iter().map(|kid| assemble(*kid, by_id, children_of)).collect())
        .unwrap_or_default();

    let (progress, status, method, calculated) = match &record.cache {
        Some(cache) => (
            cache.progress_percentage.round() as i32,
            cache.status.clone(),
            Some(cache.calculation_method.clone()),
            Some(cache.last_calculated_at.clone()),
        ),
        None => (0, "not_started".to_string(), None, None),
    };

    KpiTreeNode {
        id: record.node.id,
        change_id: record.node.change_id.clone(),
        title: record.node.title.clone(),
        level: record.node.level.clone(),
        weight: record.node.weight,
        sort_order: record.node.sort_order,
        progress,
        status,
        calculation_method: method,
        last_calculated_at: calculated,
        children,
    }
}

fn sort_siblings(nodes: &mut [KpiTreeNode]) {
    nodes.sort_by_key(|n| (n.sort_order, n.id));
    for node in nodes.iter_mut() {
        sort_siblings(&mut node.children);
    }
}

/// Total node count across the forest; every node exactly once
pub fn count_tree_nodes(forest: &[KpiTreeNode]) -> usize {
    forest
        .iter()
        .map(|n| 1 + count_tree_nodes(&n.children))
        .sum()
}

/// The most recent last_calculated_at anywhere in the forest, or None if
/// nothing has been calculated yet ("data as of" freshness)
pub fn latest_calculation_time(forest: &[KpiTreeNode]) -> Option<String> {
    let mut latest: Option<(DateTime<FixedOffset>, String)> = None;
    visit_calculated(forest, &mut latest);
    latest.map(|(_, raw)| raw)
}

fn visit_calculated(nodes: &[KpiTreeNode], latest: &mut Option<(DateTime<FixedOffset>, String)>) {
    for node in nodes {
        if let Some(raw) = &node.last_calculated_at {
            if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
                let newer = match latest {
                    Some((best, _)) => at > *best,
                    None => true,
                };
                if newer {
                    *latest = Some((at, raw.clone()));
                }
            }
        }
        visit_calculated(&node.children, latest);
    }
}
