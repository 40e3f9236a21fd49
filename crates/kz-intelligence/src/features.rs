//! Feature extraction for the local models.
//!
//! Everything here is a pure function of a [`Task`] (plus, for the duration
//! vector, a wall-clock instant). The same helpers produce the heuristic
//! training labels and the human-readable factors, tags, and reasoning that
//! accompany predictions.

use chrono::{Datelike, Local, Timelike};
use kz_core::{Task, TaskPriority};
use serde::{Deserialize, Serialize};

pub const DURATION_FEATURES: usize = 10;
pub const CATEGORY_FEATURES: usize = CATEGORY_COUNT * KEYWORD_SLOTS;
pub const CATEGORY_COUNT: usize = 10;
pub const KEYWORD_SLOTS: usize = 5;

/// Upper bound of the heuristic duration label, in minutes.
pub const MAX_HEURISTIC_MINUTES: u32 = 240;

// ---------------------------------------------------------------------------
// TaskCategory
// ---------------------------------------------------------------------------

/// The fixed topic buckets. Order is the classifier's output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Work,
    Personal,
    Study,
    Health,
    Leisure,
    Finance,
    Home,
    Shopping,
    Meetings,
    Projects,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; CATEGORY_COUNT] = [
        TaskCategory::Work,
        TaskCategory::Personal,
        TaskCategory::Study,
        TaskCategory::Health,
        TaskCategory::Leisure,
        TaskCategory::Finance,
        TaskCategory::Home,
        TaskCategory::Shopping,
        TaskCategory::Meetings,
        TaskCategory::Projects,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskCategory::Work => "work",
            TaskCategory::Personal => "personal",
            TaskCategory::Study => "study",
            TaskCategory::Health => "health",
            TaskCategory::Leisure => "leisure",
            TaskCategory::Finance => "finance",
            TaskCategory::Home => "home",
            TaskCategory::Shopping => "shopping",
            TaskCategory::Meetings => "meetings",
            TaskCategory::Projects => "projects",
        }
    }

    /// Name used by the host application's category list.
    pub fn portuguese_name(self) -> &'static str {
        match self {
            TaskCategory::Work => "Trabalho",
            TaskCategory::Personal => "Pessoal",
            TaskCategory::Study => "Estudos",
            TaskCategory::Health => "Saúde",
            TaskCategory::Leisure => "Lazer",
            TaskCategory::Finance => "Financeiro",
            TaskCategory::Home => "Casa",
            TaskCategory::Shopping => "Compras",
            TaskCategory::Meetings => "Reuniões",
            TaskCategory::Projects => "Projetos",
        }
    }

    /// Resolve a free-form label in English or Portuguese, ignoring case
    /// and surrounding whitespace or quotes.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .trim_matches(|c| c == '"' || c == '\'' || c == '.')
            .to_lowercase();
        let found = match normalized.as_str() {
            "work" | "trabalho" => TaskCategory::Work,
            "personal" | "pessoal" => TaskCategory::Personal,
            "study" | "studies" | "estudos" | "estudo" => TaskCategory::Study,
            "health" | "saúde" | "saude" => TaskCategory::Health,
            "leisure" | "lazer" => TaskCategory::Leisure,
            "finance" | "financial" | "financeiro" => TaskCategory::Finance,
            "home" | "casa" => TaskCategory::Home,
            "shopping" | "compras" => TaskCategory::Shopping,
            "meetings" | "meeting" | "reuniões" | "reunioes" => TaskCategory::Meetings,
            "projects" | "project" | "projetos" | "projeto" => TaskCategory::Projects,
            _ => return None,
        };
        Some(found)
    }

    /// How strongly a category correlates with long tasks.
    pub fn affinity(self) -> f32 {
        match self {
            TaskCategory::Work => 0.8,
            TaskCategory::Personal => 0.4,
            TaskCategory::Study => 0.6,
            TaskCategory::Health => 0.5,
            TaskCategory::Leisure => 0.3,
            TaskCategory::Finance => 0.7,
            TaskCategory::Home => 0.5,
            TaskCategory::Shopping => 0.2,
            TaskCategory::Meetings => 0.9,
            TaskCategory::Projects => 1.0,
        }
    }

    /// Keyword list for the bucket. Only the first [`KEYWORD_SLOTS`] feed
    /// the feature vector.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            TaskCategory::Work => &["trabalho", "reunião", "projeto", "cliente", "empresa", "escritório"],
            TaskCategory::Personal => &["pessoal", "família", "amigo", "casa", "relaxar"],
            TaskCategory::Study => &["estudo", "curso", "livro", "aprender", "prova", "universidade"],
            TaskCategory::Health => &["médico", "exercício", "academia", "saúde", "consulta"],
            TaskCategory::Leisure => &["filme", "jogo", "diversão", "hobby", "entretenimento"],
            TaskCategory::Finance => &["banco", "pagamento", "conta", "dinheiro", "orçamento"],
            TaskCategory::Home => &["limpar", "organizar", "cozinhar", "reforma", "manutenção"],
            TaskCategory::Shopping => &["comprar", "mercado", "shopping", "produto", "lista"],
            TaskCategory::Meetings => &["reunião", "meeting", "call", "videoconferência"],
            TaskCategory::Projects => &["projeto", "desenvolvimento", "planejamento", "entrega"],
        }
    }

    fn slots(self) -> impl Iterator<Item = &'static str> {
        self.keywords().iter().copied().take(KEYWORD_SLOTS)
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

fn lower_title(task: &Task) -> String {
    task.title.to_lowercase()
}

/// Lower-cased `title + " " + description`.
fn lower_content(task: &Task) -> String {
    format!("{} {}", task.title, task.description_text()).to_lowercase()
}

pub fn is_meeting(task: &Task) -> bool {
    let title = lower_title(task);
    title.contains("reunião") || title.contains("meeting")
}

pub fn is_project(task: &Task) -> bool {
    let title = lower_title(task);
    title.contains("projeto") || title.contains("project")
}

pub fn is_urgent(task: &Task) -> bool {
    let title = lower_title(task);
    title.contains("urgente") || title.contains("urgent")
}

fn is_important(task: &Task) -> bool {
    lower_title(task).contains("important")
}

fn has_detailed_description(task: &Task) -> bool {
    task.description_text().chars().count() > 100
}

fn priority_score(priority: Option<TaskPriority>) -> f32 {
    match priority {
        Some(TaskPriority::High) => 1.0,
        Some(TaskPriority::Medium) => 0.5,
        Some(TaskPriority::Low) | None => 0.0,
    }
}

fn flag(value: bool) -> f32 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Explicit label first, keyword inference second, neutral otherwise.
fn category_affinity(task: &Task) -> f32 {
    task.category
        .as_deref()
        .and_then(TaskCategory::from_label)
        .or_else(|| keyword_category(task))
        .map(TaskCategory::affinity)
        .unwrap_or(0.5)
}

// ---------------------------------------------------------------------------
// Feature vectors
// ---------------------------------------------------------------------------

/// Duration features using the local wall clock for the time slots.
pub fn extract_duration_features(task: &Task) -> [f32; DURATION_FEATURES] {
    extract_duration_features_at(task, &Local::now().naive_local())
}

/// Duration features with an explicit local time for slots 9 and 10.
pub fn extract_duration_features_at<T>(task: &Task, local_time: &T) -> [f32; DURATION_FEATURES]
where
    T: Datelike + Timelike,
{
    [
        task.title.chars().count() as f32 / 100.0,
        task.description_text().chars().count() as f32 / 500.0,
        priority_score(task.priority),
        category_affinity(task),
        task.title.split_whitespace().count() as f32 / 20.0,
        flag(is_meeting(task)),
        flag(is_project(task)),
        flag(is_urgent(task)),
        local_time.hour() as f32 / 24.0,
        local_time.weekday().num_days_from_sunday() as f32 / 7.0,
    ]
}

/// Keyword presence grid: slot `5 * bucket + k` is set when keyword `k` of
/// that bucket occurs in the task's title or description.
pub fn extract_category_features(task: &Task) -> [f32; CATEGORY_FEATURES] {
    let content = lower_content(task);
    let mut features = [0.0f32; CATEGORY_FEATURES];
    for category in TaskCategory::ALL {
        for (k, keyword) in category.slots().enumerate() {
            if content.contains(keyword) {
                features[category.index() * KEYWORD_SLOTS + k] = 1.0;
            }
        }
    }
    features
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

/// Bucket with the most matched keyword slots. Earlier buckets win ties.
pub fn keyword_category(task: &Task) -> Option<TaskCategory> {
    let content = lower_content(task);
    let mut best: Option<(TaskCategory, usize)> = None;
    for category in TaskCategory::ALL {
        let hits = category.slots().filter(|kw| content.contains(kw)).count();
        if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
            best = Some((category, hits));
        }
    }
    best.map(|(category, _)| category)
}

/// Rule-based duration estimate, used as the regression target.
pub fn estimate_task_duration(task: &Task) -> u32 {
    let mut minutes = 30;
    if is_meeting(task) {
        minutes += 30;
    }
    if is_project(task) {
        minutes += 60;
    }
    if task.priority == Some(TaskPriority::High) {
        minutes += 15;
    }
    if has_detailed_description(task) {
        minutes += 20;
    }
    minutes.min(MAX_HEURISTIC_MINUTES)
}

/// Human-readable reasons attached to a duration prediction.
pub fn duration_factors(task: &Task) -> Vec<String> {
    let mut factors = Vec::new();
    if task.priority == Some(TaskPriority::High) {
        factors.push("High priority".to_string());
    }
    if is_meeting(task) {
        factors.push("Meeting".to_string());
    }
    if is_project(task) {
        factors.push("Complex project".to_string());
    }
    if has_detailed_description(task) {
        factors.push("Detailed description".to_string());
    }
    if factors.is_empty() {
        factors.push("Standard analysis".to_string());
    }
    factors
}

pub fn suggested_tags(task: &Task, category: TaskCategory) -> Vec<String> {
    let mut tags = vec![category.as_str().to_string()];
    if is_urgent(task) {
        tags.push("urgent".to_string());
    }
    if is_important(task) {
        tags.push("important".to_string());
    }
    if task.priority == Some(TaskPriority::High) {
        tags.push("high-priority".to_string());
    }
    tags
}

pub fn category_reasoning(task: &Task, category: TaskCategory) -> String {
    let excerpt: String = task.title.chars().take(50).collect();
    format!(
        "Categorized as \"{}\" based on the content: \"{excerpt}...\"",
        category.portuguese_name()
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
