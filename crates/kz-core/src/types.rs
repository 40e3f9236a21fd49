use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Workflow column a task sits in. `Done` is the only terminal state.
///
/// The host application historically stored the Portuguese identifiers, so
/// those are accepted as aliases when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    #[serde(alias = "esta_semana")]
    ThisWeek,
    #[serde(alias = "hoje")]
    Today,
    #[serde(alias = "concluido")]
    Done,
}

impl TaskStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

// ---------------------------------------------------------------------------
// TaskPriority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A task record as handed over by the host. The engine never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Host-side category reference.
    #[serde(default)]
    pub category_id: Option<i64>,
    /// Resolved category name, when the host knows it.
    #[serde(default)]
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            description: None,
            status: TaskStatus::Backlog,
            priority: None,
            category_id: None,
            category: None,
            created_at: now,
            updated_at: now,
            due_date: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    /// Mark the task done at `at`, keeping `completed_at` and `status` in sync.
    pub fn completed(mut self, at: DateTime<Utc>) -> Self {
        self.status = TaskStatus::Done;
        self.completed_at = Some(at);
        self.updated_at = at;
        self
    }

    /// `completed_at` must be set exactly when the task is done.
    pub fn is_consistent(&self) -> bool {
        self.status.is_done() == self.completed_at.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Overdue means past its due date and not yet done.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_done() && self.due_date.map(|due| due < now).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_accepts_legacy_identifiers() {
        let s: TaskStatus = serde_json::from_str("\"concluido\"").unwrap();
        assert_eq!(s, TaskStatus::Done);
        let s: TaskStatus = serde_json::from_str("\"esta_semana\"").unwrap();
        assert_eq!(s, TaskStatus::ThisWeek);
        let s: TaskStatus = serde_json::from_str("\"hoje\"").unwrap();
        assert_eq!(s, TaskStatus::Today);
        assert_eq!(serde_json::to_string(&TaskStatus::Done).unwrap(), "\"done\"");
    }

    #[test]
    fn completed_keeps_invariant() {
        let task = Task::new(1, "Write report");
        assert!(task.is_consistent());

        let done = task.completed(Utc::now());
        assert!(done.is_done());
        assert!(done.is_consistent());

        let mut broken = done.clone();
        broken.completed_at = None;
        assert!(!broken.is_consistent());
    }

    #[test]
    fn overdue_requires_past_due_and_not_done() {
        let now = Utc::now();
        let late = Task::new(1, "Late").with_due_date(now - Duration::hours(1));
        assert!(late.is_overdue(now));

        let finished = late.clone().completed(now);
        assert!(!finished.is_overdue(now));

        let future = Task::new(2, "Later").with_due_date(now + Duration::hours(1));
        assert!(!future.is_overdue(now));

        assert!(!Task::new(3, "No due date").is_overdue(now));
    }

    #[test]
    fn task_deserializes_with_optional_fields_missing() {
        let json = r#"{
            "id": 7,
            "title": "Call the bank",
            "status": "backlog",
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T10:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.id, 7);
        assert!(task.description.is_none());
        assert!(task.priority.is_none());
        assert_eq!(task.description_text(), "");
    }
}
