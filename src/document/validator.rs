//! Document query validator
//!
//! Shape validation for find/aggregate specs plus the in-place rewrites applied
//! before execution: meta-key stripping, limit clamping and date-window injection.

use super::error::DocumentQueryError;
use super::fields::{DateEncoding, DateField};
use super::spec::QuerySpec;
use crate::config::QueryLimits;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Aggregation stages a generated pipeline may use
pub const ALLOWED_STAGES: &[&str] = &[
    "$match",
    "$project",
    "$group",
    "$sort",
    "$limit",
    "$unwind",
    "$addFields",
];

/// Operators rejected at any depth
pub const BLOCKED_OPERATORS: &[&str] = &[
    "$where",
    "$function",
    "$accumulator",
    "$facet",
    "$lookup",
    "$merge",
    "$out",
];

/// Non-field keys generators misplace inside filter bodies
pub const META_KEYS: &[&str] = &[
    "limit",
    "skip",
    "sort",
    "projection",
    "hint",
    "count",
    "offset",
    "page",
    "page_size",
    "max",
    "min",
];

/// Phrases that signal the question asks for a time window
pub const TEMPORAL_CUES: &[&str] = &[
    "last",
    "past",
    "recent",
    "yesterday",
    "today",
    "this week",
    "this month",
    "this year",
    "days",
    "weeks",
    "months",
    "since",
    "between",
    "before",
    "after",
    "latest",
];

/// Whole-word match over [`TEMPORAL_CUES`]
static TEMPORAL_CUE: Lazy<Regex> = Lazy::new(|| {
    let alternatives: Vec<String> = TEMPORAL_CUES.iter().map(|cue| regex::escape(cue)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).unwrap()
});

pub const DEFAULT_MAX_LIMIT: u32 = 200;
pub const DEFAULT_MAX_STAGES: usize = 10;

/// Validator with a configurable stage allow-list
#[derive(Debug, Clone)]
pub struct DocumentQueryValidator {
    allowed_stages: BTreeSet<String>,
    blocked_operators: BTreeSet<String>,
    max_stages: usize,
    max_limit: u32,
}

impl Default for DocumentQueryValidator {
    fn default() -> Self {
        Self {
            allowed_stages: ALLOWED_STAGES.iter().map(|s| s.to_string()).collect(),
            blocked_operators: BLOCKED_OPERATORS.iter().map(|s| s.to_string()).collect(),
            max_stages: DEFAULT_MAX_STAGES,
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }
}

impl DocumentQueryValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_limits(limits: &QueryLimits) -> Self {
        Self {
            max_stages: limits.max_pipeline_stages,
            max_limit: limits.max_document_limit.max(1),
            ..Self::default()
        }
    }

    pub fn with_allowed_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_limit(&self) -> u32 {
        self.max_limit
    }

    /// Structural checks, then a blocked-operator scan over the whole spec
    pub fn validate(&self, spec: &QuerySpec) -> Result<(), DocumentQueryError> {
        if let QuerySpec::Aggregate { pipeline, .. } = spec {
            if pipeline.is_empty() {
                return Err(DocumentQueryError::InvalidStageShape(
                    "aggregate pipeline must be a non-empty list".to_string(),
                ));
            }
            if pipeline.len() > self.max_stages {
                return Err(DocumentQueryError::PipelineTooLong {
                    len: pipeline.len(),
                    max: self.max_stages,
                });
            }
            for (i, stage) in pipeline.iter().enumerate() {
                let name = match stage.as_object() {
                    Some(obj) if obj.len() == 1 => obj.keys().next().cloned().unwrap_or_default(),
                    _ => {
                        return Err(DocumentQueryError::InvalidStageShape(format!(
                            "stage {} must be an object with exactly one key",
                            i
                        )))
                    }
                };
                if !self.allowed_stages.contains(&name) {
                    return Err(DocumentQueryError::DisallowedStage(name));
                }
            }
        }

        match self.find_blocked(&spec.to_value(), "") {
            Some((name, path)) => Err(DocumentQueryError::BlockedOperator { name, path }),
            None => Ok(()),
        }
    }

    fn find_blocked(&self, value: &Value, path: &str) -> Option<(String, String)> {
        match value {
            Value::Object(map) => map.iter().find_map(|(key, child)| {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                if self.blocked_operators.contains(key) {
                    return Some((key.clone(), child_path));
                }
                self.find_blocked(child, &child_path)
            }),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| self.find_blocked(item, &format!("{}[{}]", path, i))),
            _ => None,
        }
    }

    /// Clamp the limit into `[1, max]`; aggregates end with exactly one `$limit`.
    /// Returns the effective limit.
    pub fn enforce_limit(&self, spec: &mut QuerySpec, requested: i64) -> u32 {
        let effective = requested.clamp(1, self.max_limit as i64) as u32;

        match spec {
            QuerySpec::Find { limit, .. } => *limit = effective as i64,
            QuerySpec::Aggregate { pipeline, limit } => {
                pipeline.retain(|stage| {
                    !stage
                        .as_object()
                        .map_or(false, |obj| obj.contains_key("$limit"))
                });
                pipeline.push(json!({ "$limit": effective }));
                *limit = effective as i64;
            }
        }

        effective
    }

    /// Add `date_field >= now - lookback` when the question asks for a time
    /// window and the field is not constrained already. Returns whether a
    /// filter was injected.
    ///
    /// The bound matches the field's stored encoding: `{"$date": ...}` for
    /// native dates, a plain RFC 3339 string for text dates.
    pub fn enforce_date_filter(
        &self,
        spec: &mut QuerySpec,
        date_field: Option<&DateField>,
        lookback_days: i64,
        question: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(date_field) = date_field.filter(|f| !f.path.is_empty()) else {
            return false;
        };
        if !has_temporal_cue(question) {
            return false;
        }

        let field = date_field.path.as_str();
        let start = (now - Duration::days(lookback_days)).to_rfc3339_opts(SecondsFormat::Secs, true);
        let bound = match date_field.encoding {
            DateEncoding::Native => json!({ "$date": start }),
            DateEncoding::Text => Value::String(start),
        };
        let condition = json!({ "$gte": bound });

        match spec {
            QuerySpec::Find { filter, .. } => {
                if mentions_key(&Value::Object(filter.clone()), field) {
                    return false;
                }
                filter.insert(field.to_string(), condition);
            }
            QuerySpec::Aggregate { pipeline, .. } => {
                let constrained = pipeline
                    .iter()
                    .filter_map(|stage| stage.get("$match"))
                    .any(|body| mentions_key(body, field));
                if constrained {
                    return false;
                }
                let mut body = Map::new();
                body.insert(field.to_string(), condition);
                pipeline.insert(0, json!({ "$match": body }));
            }
        }

        true
    }
}

pub fn has_temporal_cue(question: &str) -> bool {
    TEMPORAL_CUE.is_match(question)
}

fn mentions_key(value: &Value, field: &str) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, child)| key == field || mentions_key(child, field)),
        Value::Array(items) => items.iter().any(|item| mentions_key(item, field)),
        _ => false,
    }
}

/// Remove meta-keys from find filters and `$match` bodies, at any depth.
/// Returns how many keys were removed.
pub fn strip_meta_keys(spec: &mut QuerySpec) -> usize {
    match spec {
        QuerySpec::Find { filter, .. } => strip_map(filter),
        QuerySpec::Aggregate { pipeline, .. } => pipeline
            .iter_mut()
            .filter_map(|stage| stage.get_mut("$match"))
            .map(strip_value)
            .sum(),
    }
}

fn strip_map(map: &mut Map<String, Value>) -> usize {
    let before = map.len();
    map.retain(|key, _| !META_KEYS.contains(&key.as_str()));
    let removed = before - map.len();
    removed + map.values_mut().map(strip_value).sum::<usize>()
}

fn strip_value(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => strip_map(map),
        Value::Array(items) => items.iter_mut().map(strip_value).sum(),
        _ => 0,
    }
}
