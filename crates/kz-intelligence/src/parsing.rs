//! Defensive parsing of free-text provider replies.
//!
//! Models wrap their JSON in prose or code fences more often than not, so the
//! object is located inside the text rather than parsed from the whole reply.

use kz_core::Task;
use serde_json::{Map, Value};

use crate::features::{category_reasoning, duration_factors, suggested_tags, TaskCategory};
use crate::providers::ProviderError;

pub const DEFAULT_REMOTE_MINUTES: f64 = 30.0;
pub const DEFAULT_REMOTE_CONFIDENCE: f32 = 0.7;
/// Confidence given to a duration recovered from a bare number.
pub const BARE_NUMBER_CONFIDENCE: f32 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDuration {
    pub minutes: u32,
    pub confidence: f32,
    pub factors: Vec<String>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCategory {
    pub category: TaskCategory,
    pub confidence: f32,
    pub tags: Vec<String>,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Find a JSON object embedded in `text`.
///
/// Tries the span from the first `{` to the last `}` first, then every
/// balanced-brace candidate from left to right.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let first = text.find('{')?;
    let last = text.rfind('}')?;
    if last > first {
        if let Ok(Value::Object(map)) = serde_json::from_str(&text[first..=last]) {
            return Some(map);
        }
    }

    for (start, _) in text.match_indices('{') {
        if let Some(end) = balanced_end(&text[start..]) {
            if let Ok(Value::Object(map)) = serde_json::from_str(&text[start..start + end]) {
                return Some(map);
            }
        }
    }
    None
}

/// Byte length of the brace-balanced prefix of `text`, which starts at `{`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// First run of ASCII digits in `text`, saturating at `u64::MAX`.
pub fn first_integer(text: &str) -> Option<u64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let value = text[start..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |acc, d| acc.saturating_mul(10).saturating_add(u64::from(d - b'0')));
    Some(value)
}

fn number_field(map: &Map<String, Value>, key: &str) -> Option<f64> {
    match map.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_list(map: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    let items: Vec<String> = map
        .get(key)?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn clamp_confidence(value: Option<f64>) -> f32 {
    match value {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0) as f32,
        _ => DEFAULT_REMOTE_CONFIDENCE,
    }
}

// ---------------------------------------------------------------------------
// Duration
// ---------------------------------------------------------------------------

pub fn parse_duration_reply(text: &str, task: &Task) -> Result<RemoteDuration, ProviderError> {
    if let Some(map) = extract_json_object(text) {
        // Zero means the model gave no estimate.
        let raw = number_field(&map, "minutes")
            .filter(|m| *m != 0.0)
            .unwrap_or(DEFAULT_REMOTE_MINUTES);
        if !raw.is_finite() {
            return Err(ProviderError::Parse(format!("non-finite minutes in reply: {raw}")));
        }
        let minutes = raw.round().clamp(1.0, u32::MAX as f64) as u32;
        return Ok(RemoteDuration {
            minutes,
            confidence: clamp_confidence(number_field(&map, "confidence")),
            factors: string_list(&map, "factors").unwrap_or_else(|| duration_factors(task)),
            reasoning: string_field(&map, "reasoning"),
        });
    }

    let n = first_integer(text)
        .ok_or_else(|| ProviderError::Parse("no duration found in reply".into()))?;
    Ok(RemoteDuration {
        minutes: n.clamp(1, u32::MAX as u64) as u32,
        confidence: BARE_NUMBER_CONFIDENCE,
        factors: duration_factors(task),
        reasoning: None,
    })
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

pub fn parse_category_reply(text: &str, task: &Task) -> Result<RemoteCategory, ProviderError> {
    let (category, confidence, tags, reasoning) = match extract_json_object(text) {
        Some(map) => {
            let label = string_field(&map, "category")
                .ok_or_else(|| ProviderError::Parse("reply has no category field".into()))?;
            let category = TaskCategory::from_label(&label)
                .ok_or_else(|| ProviderError::Parse(format!("unknown category {label:?}")))?;
            (
                category,
                clamp_confidence(number_field(&map, "confidence")),
                string_list(&map, "tags"),
                string_field(&map, "reasoning"),
            )
        }
        None => {
            let category = TaskCategory::from_label(text)
                .ok_or_else(|| ProviderError::Parse(format!("unknown category {:?}", text.trim())))?;
            (category, DEFAULT_REMOTE_CONFIDENCE, None, None)
        }
    };

    Ok(RemoteCategory {
        category,
        confidence,
        tags: tags.unwrap_or_else(|| suggested_tags(task, category)),
        reasoning: reasoning.unwrap_or_else(|| category_reasoning(task, category)),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
