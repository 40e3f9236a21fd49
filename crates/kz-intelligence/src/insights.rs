//! Corpus-level heuristics: productivity trend, working-hour pattern, and
//! burnout risk. No model inference happens here.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Local, TimeZone, Timelike, Utc};
use kz_core::{FeatureFlags, Task, TaskPriority};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const PRODUCTIVITY_HIGH_RATE: f64 = 0.8;
pub const PRODUCTIVITY_LOW_RATE: f64 = 0.5;
pub const MIN_TIMED_COMPLETIONS: usize = 5;
pub const BURNOUT_WINDOW_DAYS: i64 = 7;
pub const BURNOUT_SCORE_LIMIT: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsightType {
    ProductivityHigh,
    ProductivityLow,
    TimingOptimal,
    BreakNeeded,
    BurnoutRisk,
    PatternDetected,
    ScheduleSuggestion,
    TaskPrediction,
    CategorySuggestion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiInsight {
    pub id: String,
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl AiInsight {
    fn new(prefix: &str, insight_type: InsightType, confidence: f32, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{prefix}-{}", Uuid::new_v4()),
            insight_type,
            title: String::new(),
            description: String::new(),
            recommendation: String::new(),
            confidence,
            created_at: now,
            metadata: BTreeMap::new(),
        }
    }

    fn text(mut self, title: impl Into<String>, description: impl Into<String>, recommendation: impl Into<String>) -> Self {
        self.title = title.into();
        self.description = description.into();
        self.recommendation = recommendation.into();
        self
    }

    fn meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Stateless; every call looks at the full corpus it is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsightGenerator;

impl InsightGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Run every enabled heuristic against the local wall clock.
    pub fn generate(&self, tasks: &[Task], flags: &FeatureFlags) -> Vec<AiInsight> {
        self.generate_at(tasks, flags, Utc::now(), &Local)
    }

    /// Run every enabled heuristic as of `now`, bucketing hours in `tz`.
    pub fn generate_at<Tz: TimeZone>(
        &self,
        tasks: &[Task],
        flags: &FeatureFlags,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> Vec<AiInsight> {
        if tasks.is_empty() {
            return Vec::new();
        }
        let mut insights = Vec::new();
        if flags.productivity_analysis {
            insights.extend(productivity_trend(tasks, now));
        }
        if flags.work_pattern_analysis {
            insights.extend(timing_pattern(tasks, now, tz));
        }
        if flags.burnout_detection {
            insights.extend(burnout_risk(tasks, now));
        }
        insights
    }
}

pub fn productivity_trend(tasks: &[Task], now: DateTime<Utc>) -> Option<AiInsight> {
    let total = tasks.len();
    if total == 0 {
        return None;
    }
    let done = tasks.iter().filter(|t| t.is_done()).count();
    let rate = done as f64 / total as f64;
    let percent = (rate * 100.0).round();

    let insight = if rate > PRODUCTIVITY_HIGH_RATE {
        AiInsight::new("productivity", InsightType::ProductivityHigh, 0.9, now).text(
            "High productivity",
            format!("You have completed {percent}% of your tasks."),
            "Keep the current rhythm and consider taking on more ambitious goals.",
        )
    } else if rate < PRODUCTIVITY_LOW_RATE {
        AiInsight::new("productivity", InsightType::ProductivityLow, 0.8, now).text(
            "Productivity could improve",
            format!("Only {percent}% of your tasks are completed."),
            "Break large tasks into smaller steps and focus on a few priorities each day.",
        )
    } else {
        return None;
    };
    Some(
        insight
            .meta("completion_rate", json!(rate))
            .meta("completed", json!(done))
            .meta("total", json!(total)),
    )
}

pub fn timing_pattern<Tz: TimeZone>(tasks: &[Task], now: DateTime<Utc>, tz: &Tz) -> Option<AiInsight> {
    let mut by_hour = [0usize; 24];
    let mut timed = 0;
    for at in tasks.iter().filter(|t| t.is_done()).filter_map(|t| t.completed_at) {
        by_hour[at.with_timezone(tz).hour() as usize] += 1;
        timed += 1;
    }
    if timed < MIN_TIMED_COMPLETIONS {
        return None;
    }

    // Strictly greater, so the earliest hour wins ties.
    let mut best_hour = 0;
    for hour in 1..24 {
        if by_hour[hour] > by_hour[best_hour] {
            best_hour = hour;
        }
    }
    Some(
        AiInsight::new("timing", InsightType::TimingOptimal, 0.75, now)
            .text(
                "Optimal working hour",
                format!("You complete most of your tasks around {best_hour:02}:00."),
                format!("Schedule your most important work near {best_hour:02}:00."),
            )
            .meta("hour", json!(best_hour))
            .meta("completions_at_hour", json!(by_hour[best_hour]))
            .meta("timed_completions", json!(timed)),
    )
}

pub fn burnout_risk(tasks: &[Task], now: DateTime<Utc>) -> Option<AiInsight> {
    let since = now - Duration::days(BURNOUT_WINDOW_DAYS);
    let recent: Vec<&Task> = tasks.iter().filter(|t| t.created_at >= since).collect();
    let high = recent
        .iter()
        .filter(|t| t.priority == Some(TaskPriority::High))
        .count();
    let overdue = recent.iter().filter(|t| t.is_overdue(now)).count();
    let score = 0.3 * high as f64 + 0.5 * overdue as f64;
    if score <= BURNOUT_SCORE_LIMIT {
        return None;
    }
    Some(
        AiInsight::new("burnout", InsightType::BurnoutRisk, 0.8, now)
            .text(
                "Burnout risk",
                format!(
                    "In the last {BURNOUT_WINDOW_DAYS} days you created {high} high-priority tasks and {overdue} are overdue."
                ),
                "Take regular breaks, renegotiate deadlines, and delegate where you can.",
            )
            .meta("score", json!(score))
            .meta("high_priority", json!(high))
            .meta("overdue", json!(overdue)),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 18, 0, 0).unwrap()
    }

    fn done_at(id: i64, hour: u32) -> Task {
        let at = Utc.with_ymd_and_hms(2024, 5, 9, hour, 15, 0).unwrap();
        Task::new(id, format!("task {id}")).with_created_at(at).completed(at)
    }

    #[test]
    fn empty_corpus_yields_nothing() {
        let out = InsightGenerator::new().generate_at(&[], &FeatureFlags::default(), now(), &Utc);
        assert!(out.is_empty());
    }

    #[test]
    fn exact_high_rate_is_not_reported() {
        let mut tasks: Vec<Task> = (0..4).map(|i| done_at(i, 9)).collect();
        tasks.push(Task::new(9, "open").with_created_at(now()));
        assert!(productivity_trend(&tasks, now()).is_none());

        tasks.push(done_at(10, 9));
        let insight = productivity_trend(&tasks, now()).unwrap();
        assert_eq!(insight.insight_type, InsightType::ProductivityHigh);
        assert!((insight.confidence - 0.9).abs() < 1e-6);
        assert!(insight.id.starts_with("productivity-"));
    }

    #[test]
    fn low_rate_is_reported() {
        let tasks = vec![done_at(1, 9), Task::new(2, "a"), Task::new(3, "b")];
        let insight = productivity_trend(&tasks, now()).unwrap();
        assert_eq!(insight.insight_type, InsightType::ProductivityLow);
        assert_eq!(insight.metadata["total"], 3);
    }

    #[test]
    fn timing_needs_five_timed_completions() {
        let tasks: Vec<Task> = (0..4).map(|i| done_at(i, 10)).collect();
        assert!(timing_pattern(&tasks, now(), &Utc).is_none());

        // Untimed completions do not count.
        let mut untimed = Task::new(99, "legacy").completed(now());
        untimed.completed_at = None;
        let mut with_untimed = tasks.clone();
        with_untimed.push(untimed);
        assert!(timing_pattern(&with_untimed, now(), &Utc).is_none());
    }

    #[test]
    fn timing_ties_go_to_the_earliest_hour() {
        let tasks = vec![
            done_at(1, 15),
            done_at(2, 15),
            done_at(3, 9),
            done_at(4, 9),
            done_at(5, 11),
        ];
        let insight = timing_pattern(&tasks, now(), &Utc).unwrap();
        assert_eq!(insight.insight_type, InsightType::TimingOptimal);
        assert_eq!(insight.metadata["hour"], 9);
        assert!(insight.description.contains("09:00"));
    }

    #[test]
    fn timing_uses_the_given_timezone() {
        let tasks: Vec<Task> = (0..5).map(|i| done_at(i, 12)).collect();
        let tz = chrono::FixedOffset::east_opt(-3 * 3600).unwrap();
        let insight = timing_pattern(&tasks, now(), &tz).unwrap();
        assert_eq!(insight.metadata["hour"], 9);
    }

    #[test]
    fn burnout_counts_recent_high_and_overdue() {
        let recent = now() - Duration::days(1);
        let mut tasks = Vec::new();
        for i in 0..5 {
            tasks.push(
                Task::new(i, "urgent")
                    .with_created_at(recent)
                    .with_priority(TaskPriority::High)
                    .with_due_date(recent),
            );
        }
        // 5 * 0.3 + 5 * 0.5 = 4.0
        let insight = burnout_risk(&tasks, now()).unwrap();
        assert_eq!(insight.insight_type, InsightType::BurnoutRisk);
        assert!((insight.confidence - 0.8).abs() < 1e-6);

        // Old tasks fall outside the window.
        let old: Vec<Task> = tasks
            .iter()
            .cloned()
            .map(|t| t.with_created_at(now() - Duration::days(10)))
            .collect();
        assert!(burnout_risk(&old, now()).is_none());
    }

    #[test]
    fn flags_gate_each_heuristic() {
        let tasks: Vec<Task> = (0..6).map(|i| done_at(i, 8)).collect();
        let all = InsightGenerator::new().generate_at(&tasks, &FeatureFlags::default(), now(), &Utc);
        let kinds: Vec<InsightType> = all.iter().map(|i| i.insight_type).collect();
        assert_eq!(kinds, vec![InsightType::ProductivityHigh, InsightType::TimingOptimal]);

        let flags = FeatureFlags {
            productivity_analysis: false,
            ..FeatureFlags::default()
        };
        let some = InsightGenerator::new().generate_at(&tasks, &flags, now(), &Utc);
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].insight_type, InsightType::TimingOptimal);
    }

    #[test]
    fn insight_type_uses_kebab_case() {
        assert_eq!(
            serde_json::to_value(InsightType::BurnoutRisk).unwrap(),
            "burnout-risk"
        );
    }
}
