//! Zombie goal detection
//!
//! A pure filter over already-cached data: active nodes whose cache has not
//! been recalculated within the threshold window (or that were never
//! calculated since creation) are flagged, staleness descending. No
//! recomputation happens here.

use crate::db::KpiRecord;
use chrono::{DateTime, Local};
use serde::Serialize;

/// Default staleness window in days
pub const DEFAULT_STALE_DAYS: i64 = 14;

/// Default cap on flagged goals per page
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// An active node with no recent logged activity
#[derive(Debug, Clone, Serialize)]
pub struct ZombieGoal {
    pub kpi_id: i32,
    pub change_id: String,
    pub title: String,
    pub level: String,
    pub days_stale: i64,
    /// last_calculated_at, or created_at if never calculated
    pub last_activity: String,
}

/// Flag active nodes whose freshness timestamp is older than threshold_days,
/// most stale first, capped to page_size
pub fn detect_zombies(
    records: &[KpiRecord],
    threshold_days: i64,
    page_size: usize,
    now: DateTime<Local>,
) -> Vec<ZombieGoal> {
    let mut zombies: Vec<ZombieGoal> = records
        .iter()
        .filter(|r| r.node.is_active)
        .filter_map(|r| {
            let raw = match &r.cache {
                Some(cache) => cache.last_calculated_at.as_str(),
                None => r.node.created_at.as_str(),
            };
            let at = DateTime::parse_from_rfc3339(raw).ok()?;
            let days_stale = (now.with_timezone(&at.timezone()) - at).num_days();
            if days_stale <= threshold_days {
                return None;
            }
            Some(ZombieGoal {
                kpi_id: r.node.id,
                change_id: r.node.change_id.clone(),
                title: r.node.title.clone(),
                level: r.node.level.clone(),
                days_stale,
                last_activity: raw.to_string(),
            })
        })
        .collect();

    zombies.sort_by(|a, b| b.days_stale.cmp(&a.days_stale).then(a.kpi_id.cmp(&b.kpi_id)));
    zombies.truncate(page_size);
    zombies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{KpiNode, KpiRecord, ProgressCache};
    use chrono::{Duration, TimeZone};

    fn record(id: i32, created_days_ago: i64, calculated_days_ago: Option<i64>, now: DateTime<Local>) -> KpiRecord {
        let created = (now - Duration::days(created_days_ago)).to_rfc3339();
        let cache = calculated_days_ago.map(|days| ProgressCache {
            id,
            kpi_id: id,
            progress_percentage: 10.0,
            status: "in_progress".to_string(),
            child_count: 0,
            completed_child_count: 0,
            calculation_method: "direct_log".to_string(),
            manual_override_reason: None,
            formula_json: None,
            row_version: 1,
            last_calculated_at: (now - Duration::days(days)).to_rfc3339(),
        });
        KpiRecord {
            node: KpiNode {
                id,
                change_id: format!("cid-{}", id),
                vision_id: 1,
                parent_kpi_id: None,
                level: "weekly".to_string(),
                title: format!("KPI {}", id),
                description: None,
                weight: 1.0,
                target_value: None,
                target_date: None,
                period_start: None,
                period_end: None,
                is_active: true,
                sort_order: 0,
                created_at: created.clone(),
                updated_at: created,
            },
            cache,
        }
    }

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_flags_only_past_threshold() {
        let now = now();
        let records = vec![
            record(1, 60, Some(30), now), // stale
            record(2, 60, Some(3), now),  // fresh
            record(3, 60, Some(14), now), // exactly at threshold - not flagged
        ];
        let zombies = detect_zombies(&records, DEFAULT_STALE_DAYS, DEFAULT_PAGE_SIZE, now);
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].kpi_id, 1);
        assert_eq!(zombies[0].days_stale, 30);
    }

    #[test]
    fn test_never_calculated_uses_creation_time() {
        let now = now();
        let records = vec![record(1, 20, None, now), record(2, 2, None, now)];
        let zombies = detect_zombies(&records, DEFAULT_STALE_DAYS, DEFAULT_PAGE_SIZE, now);
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].kpi_id, 1);
    }

    #[test]
    fn test_sorted_most_stale_first_and_capped() {
        let now = now();
        let records = vec![
            record(1, 90, Some(20), now),
            record(2, 90, Some(50), now),
            record(3, 90, Some(35), now),
        ];
        let zombies = detect_zombies(&records, DEFAULT_STALE_DAYS, 2, now);
        assert_eq!(zombies.len(), 2);
        assert_eq!(zombies[0].kpi_id, 2);
        assert_eq!(zombies[1].kpi_id, 3);
    }
}
