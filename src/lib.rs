//! Trellis - Progress engine for vision-driven goal tracking
//!
//! Break a long-term vision into a KPI tree, log completions at the leaves,
//! and read precomputed progress anywhere in the tree in O(1).
//!
//! # Levels
//!
//! | Level | Holds |
//! |-------|-------|
//! | `quarterly` | monthly KPIs |
//! | `monthly` | weekly KPIs |
//! | `weekly` | daily KPIs |
//! | `daily` | completion logs |
//!
//! Each node's percentage is a weighted average of its children (or comes
//! straight from its own logs at the leaves). Every completion log walks the
//! changed ancestor chain bottom-up and refreshes one denormalized cache row
//! per node, so reads never re-walk the tree.
//!
//! # Quick Start
//!
//! ```no_run
//! use trellis::db::{Database, KpiDraft, KpiLevel};
//! use trellis::recalc::Recalculator;
//!
//! let db = Database::new("trellis.db").unwrap();
//! let vision = db.create_vision("Run a marathon", None).unwrap();
//! let kpi = db.create_kpi(&KpiDraft {
//!     vision_id: vision,
//!     parent_kpi_id: None,
//!     level: KpiLevel::Quarterly,
//!     title: "Base building".to_string(),
//!     description: None,
//!     weight: None,
//!     target_value: Some(200.0),
//!     target_date: None,
//!     period_start: None,
//!     period_end: None,
//! }).unwrap();
//!
//! // Log 50 of the 200 target miles
//! let recalc = Recalculator::new(&db);
//! let today = chrono::Local::now().date_naive();
//! let outcome = recalc.log_completion(kpi, today, true, Some(50.0)).unwrap();
//! assert_eq!(outcome.cache.progress_percentage, 25.0);
//! ```

pub mod config;
pub mod db;
pub mod formula;
pub mod init;
pub mod recalc;
pub mod schema;
pub mod serve;
pub mod stale;
pub mod streak;
pub mod tree;

pub use config::Config;
pub use db::{
    CacheWrite, CompletionLog, Database, DbError, EngineSchema, KpiDraft, KpiLevel, KpiNode,
    KpiRecord, ProgressCache, StreakRecovery, Vision, CURRENT_SCHEMA,
};
pub use formula::{
    compute, derive_status, AtRiskPolicy, CalculationMethod, ChildProgress, Formula,
    FormulaComponent, ManualOverride, ProgressStatus,
};
pub use recalc::{LogOutcome, Recalculator};
pub use stale::{detect_zombies, ZombieGoal};
pub use streak::{
    attempt_recovery, current_streak, longest_streak, streak_summary, RecoveryState, StreakSummary,
};
pub use tree::{build_forest, count_tree_nodes, latest_calculation_time, KpiTreeNode};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify core types are re-exported from crate root
        let _ = CURRENT_SCHEMA;
    }
}
