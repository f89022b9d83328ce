//! Weighted progress rollup
//!
//! Pure computation of a node's percentage from its children's
//! (progress, weight) pairs, with a transparent breakdown users can audit.
//! The resulting Formula is a first-class API response, not an internal
//! detail: the serialized form is what the cache stores and the viewer shows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How a cached percentage was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationMethod {
    WeightedRollup,
    DirectLog,
    ManualOverride,
}

impl CalculationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationMethod::WeightedRollup => "weighted_rollup",
            CalculationMethod::DirectLog => "direct_log",
            CalculationMethod::ManualOverride => "manual_override",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weighted_rollup" => Some(CalculationMethod::WeightedRollup),
            "direct_log" => Some(CalculationMethod::DirectLog),
            "manual_override" => Some(CalculationMethod::ManualOverride),
            _ => None,
        }
    }
}

impl std::fmt::Display for CalculationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derived display status for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
    AtRisk,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::AtRisk => "at_risk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(ProgressStatus::NotStarted),
            "in_progress" => Some(ProgressStatus::InProgress),
            "completed" => Some(ProgressStatus::Completed),
            "at_risk" => Some(ProgressStatus::AtRisk),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One child's (progress, weight) pair as fed into the rollup
#[derive(Debug, Clone)]
pub struct ChildProgress {
    pub kpi_id: i32,
    pub title: String,
    pub progress: f64,
    pub weight: f64,
}

/// A user-set percentage that bypasses the rollup
#[derive(Debug, Clone)]
pub struct ManualOverride {
    pub percentage: f64,
    pub reason: String,
}

/// One child's share of the result; contributions sum to result_percentage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaComponent {
    pub kpi_id: i32,
    pub title: String,
    pub progress: f64,
    pub weight: f64,
    pub contribution: f64,
}

/// The transparent breakdown behind a cached percentage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    pub result_percentage: f64,
    pub method: CalculationMethod,
    pub components: Vec<FormulaComponent>,
    /// Human-readable form, e.g. "(80×1 + 60×2) / 3 = 66.7%"
    pub expression: String,
    pub override_reason: Option<String>,
}

impl Formula {
    /// Rounded percentage for display; intermediate math stays fractional
    pub fn display_percentage(&self) -> i32 {
        self.result_percentage.round() as i32
    }
}

/// Format a number without a trailing ".0"
fn fmt_num(n: f64) -> String {
    if (n - n.round()).abs() < 1e-9 {
        format!("{}", n.round() as i64)
    } else {
        format!("{:.1}", n)
    }
}

/// Compute a node's percentage from its children, or from a manual override.
///
/// Empty children with no override means the node is a leaf whose percentage
/// comes from its own completion logs; callers compute that separately (see
/// [`direct_log`]) - the 0% here is a defer signal, not a result.
pub fn compute(children: &[ChildProgress], manual: Option<&ManualOverride>) -> Formula {
    if let Some(m) = manual {
        let pct = m.percentage.clamp(0.0, 100.0);
        return Formula {
            result_percentage: pct,
            method: CalculationMethod::ManualOverride,
            components: Vec::new(),
            expression: format!("override = {}%", fmt_num(pct)),
            override_reason: Some(m.reason.clone()),
        };
    }

    if children.is_empty() {
        return Formula {
            result_percentage: 0.0,
            method: CalculationMethod::DirectLog,
            components: Vec::new(),
            expression: "no children; progress comes from completion logs".to_string(),
            override_reason: None,
        };
    }

    // All-zero weights would divide by zero; fall back to uniform weighting
    let total_weight: f64 = children.iter().map(|c| c.weight).sum();
    let uniform = total_weight <= 0.0;
    let divisor = if uniform { children.len() as f64 } else { total_weight };

    let components: Vec<FormulaComponent> = children
        .iter()
        .map(|c| {
            let weight = if uniform { 1.0 } else { c.weight };
            FormulaComponent {
                kpi_id: c.kpi_id,
                title: c.title.clone(),
                progress: c.progress,
                weight,
                contribution: (c.progress * weight) / divisor,
            }
        })
        .collect();

    let raw: f64 = components.iter().map(|c| c.contribution).sum();
    let result = raw.clamp(0.0, 100.0);

    let terms: Vec<String> = components
        .iter()
        .map(|c| format!("{}×{}", fmt_num(c.progress), fmt_num(c.weight)))
        .collect();
    let expression = format!(
        "({}) / {} = {}%",
        terms.join(" + "),
        fmt_num(divisor),
        fmt_num((result * 10.0).round() / 10.0)
    );

    Formula {
        result_percentage: result,
        method: CalculationMethod::WeightedRollup,
        components,
        expression,
        override_reason: None,
    }
}

/// The Formula for a leaf whose percentage came from its own logs
pub fn direct_log(percentage: f64, detail: &str) -> Formula {
    let pct = percentage.clamp(0.0, 100.0);
    Formula {
        result_percentage: pct,
        method: CalculationMethod::DirectLog,
        components: Vec::new(),
        expression: format!("{}% {}", fmt_num(pct), detail),
        override_reason: None,
    }
}

// ============================================================================
// Status Derivation
// ============================================================================

/// Thresholds for flagging a node as behind schedule. A node is at_risk when
/// its progress sits below behind_ratio while less than remaining_ratio of
/// its period remains (a past-due period counts as nothing remaining).
#[derive(Debug, Clone, Copy)]
pub struct AtRiskPolicy {
    pub behind_ratio: f64,
    pub remaining_ratio: f64,
}

impl Default for AtRiskPolicy {
    fn default() -> Self {
        Self {
            behind_ratio: 0.5,
            remaining_ratio: 0.25,
        }
    }
}

/// Derive display status once the percentage is known.
///
/// has_any_progress distinguishes "nothing has happened" from "children have
/// progress that rolls up to zero" (zero-weight children, for example).
pub fn derive_status(
    percentage: f64,
    has_any_progress: bool,
    period: Option<(NaiveDate, NaiveDate)>,
    today: NaiveDate,
    policy: &AtRiskPolicy,
) -> ProgressStatus {
    if percentage >= 100.0 {
        return ProgressStatus::Completed;
    }
    if percentage <= 0.0 && !has_any_progress {
        return ProgressStatus::NotStarted;
    }

    if let Some((start, end)) = period {
        let total_days = (end - start).num_days();
        if total_days > 0 {
            let remaining_days = (end - today).num_days().max(0);
            let remaining = remaining_days as f64 / total_days as f64;
            if percentage < policy.behind_ratio * 100.0 && remaining < policy.remaining_ratio {
                return ProgressStatus::AtRisk;
            }
        }
    }

    ProgressStatus::InProgress
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn child(kpi_id: i32, progress: f64, weight: f64) -> ChildProgress {
        ChildProgress {
            kpi_id,
            title: format!("KPI {}", kpi_id),
            progress,
            weight,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_weighted_rollup() {
        let f = compute(&[child(1, 80.0, 1.0), child(2, 60.0, 2.0)], None);
        assert_eq!(f.method, CalculationMethod::WeightedRollup);
        assert_eq!(f.display_percentage(), 67);
        assert_eq!(f.expression, "(80×1 + 60×2) / 3 = 66.7%");
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let f = compute(&[child(1, 50.0, 0.0), child(2, 90.0, 0.0)], None);
        assert_eq!(f.display_percentage(), 70);
        assert!(f.components.iter().all(|c| c.weight == 1.0));
    }

    #[test]
    fn test_contributions_sum_to_result() {
        let f = compute(
            &[child(1, 80.0, 1.0), child(2, 60.0, 2.0), child(3, 25.0, 0.5)],
            None,
        );
        let sum: f64 = f.components.iter().map(|c| c.contribution).sum();
        assert!((sum - f.result_percentage).abs() < 1e-9);
    }

    #[test]
    fn test_manual_override_wins() {
        let f = compute(
            &[child(1, 80.0, 1.0)],
            Some(&ManualOverride {
                percentage: 42.0,
                reason: "migrated from spreadsheet".to_string(),
            }),
        );
        assert_eq!(f.result_percentage, 42.0);
        assert_eq!(f.method, CalculationMethod::ManualOverride);
        assert!(f.components.is_empty());
        assert_eq!(f.override_reason.as_deref(), Some("migrated from spreadsheet"));
    }

    #[test]
    fn test_empty_children_defers_to_logs() {
        let f = compute(&[], None);
        assert_eq!(f.result_percentage, 0.0);
        assert_eq!(f.method, CalculationMethod::DirectLog);
    }

    #[test]
    fn test_formula_serializes_round_trip() {
        let f = compute(&[child(1, 80.0, 1.0), child(2, 60.0, 2.0)], None);
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"weighted_rollup\""));
        let back: Formula = serde_json::from_str(&json).unwrap();
        assert_eq!(back.result_percentage, f.result_percentage);
        assert_eq!(back.components.len(), 2);
    }

    #[test]
    fn test_status_completed_and_not_started() {
        let policy = AtRiskPolicy::default();
        let today = date("2024-06-15");
        assert_eq!(
            derive_status(100.0, true, None, today, &policy),
            ProgressStatus::Completed
        );
        assert_eq!(
            derive_status(0.0, false, None, today, &policy),
            ProgressStatus::NotStarted
        );
        // Zero rollup with child progress is still underway
        assert_eq!(
            derive_status(0.0, true, None, today, &policy),
            ProgressStatus::InProgress
        );
    }

    #[test]
    fn test_status_at_risk_near_period_end() {
        let policy = AtRiskPolicy::default();
        let period = Some((date("2024-01-01"), date("2024-01-31")));

        // 30% done with 3 of 30 days left
        assert_eq!(
            derive_status(30.0, true, period, date("2024-01-28"), &policy),
            ProgressStatus::AtRisk
        );
        // Same progress mid-period is just in progress
        assert_eq!(
            derive_status(30.0, true, period, date("2024-01-10"), &policy),
            ProgressStatus::InProgress
        );
        // Past due and unfinished stays at risk
        assert_eq!(
            derive_status(60.0, true, period, date("2024-02-10"), &policy),
            ProgressStatus::InProgress
        );
        assert_eq!(
            derive_status(40.0, true, period, date("2024-02-10"), &policy),
            ProgressStatus::AtRisk
        );
    }

    proptest! {
        #[test]
        fn prop_contributions_sum_to_result(
            progresses in proptest::collection::vec(0.0f64..=100.0, 1..8),
            weights in proptest::collection::vec(0.0f64..=10.0, 1..8),
        ) {
            let n = progresses.len().min(weights.len());
            let children: Vec<ChildProgress> = (0..n)
                .map(|i| child(i as i32, progresses[i], weights[i]))
                .collect();
            let f = compute(&children, None);
            let sum: f64 = f.components.iter().map(|c| c.contribution).sum();
            prop_assert!((sum - f.result_percentage).abs() < 1e-6);
            prop_assert!((0.0..=100.0).contains(&f.result_percentage));
        }
    }
}
