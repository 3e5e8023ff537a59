//! Text-generation collaborator and output cleanup
//!
//! The generator is external and untrusted: it receives a [`GenerationRequest`]
//! and returns raw text. Helpers here only pull a candidate query out of that
//! text; nothing is assumed about its safety.

use crate::error::AppResult;
use crate::guard::enforce_row_limit;
use crate::schema::{CategoricalHints, SchemaMap};
use async_trait::async_trait;
use serde::Serialize;

/// What the generator is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationTarget {
    Sql,
    DocumentSpec,
}

/// Everything a generator may use to build a prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub target: GenerationTarget,
    pub question: String,
    pub tables: SchemaMap,
    pub categorical_values: CategoricalHints,
    pub join_hints: Vec<String>,
    pub limit: u32,
    /// SQL should use the `{table}` placeholder for the selected dataset
    pub uses_placeholder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_field: Option<String>,
    pub lookback_days: i64,
    /// Output of a failed attempt, sent back for repair
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_invalid_output: Option<String>,
}

impl GenerationRequest {
    pub fn new(target: GenerationTarget, question: impl Into<String>, limit: u32) -> Self {
        Self {
            target,
            question: question.into(),
            tables: SchemaMap::new(),
            categorical_values: CategoricalHints::new(),
            join_hints: Vec::new(),
            limit,
            uses_placeholder: false,
            collection: None,
            fields: Vec::new(),
            date_field: None,
            lookback_days: 0,
            previous_invalid_output: None,
        }
    }
}

/// External query generator
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> AppResult<String>;
}

/// Remove surrounding Markdown code fences (```sql ... ```)
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string on the opening fence
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Generated SQL with fences and terminators removed and its top-level
/// `LIMIT` bounded by `limit`
pub fn clean_generated_sql(raw: &str, limit: u32) -> String {
    let sql = strip_code_fences(raw)
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .trim();

    if sql.is_empty() {
        return String::new();
    }
    enforce_row_limit(sql, limit)
}

/// First balanced `{...}` in `text`, honoring JSON strings and escapes
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
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
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_code_fences("  SELECT 1  "), "SELECT 1");
        assert_eq!(strip_code_fences("```\nSELECT 2```"), "SELECT 2");
    }

    #[test]
    fn test_clean_generated_sql_appends_limit() {
        assert_eq!(
            clean_generated_sql("```sql\nSELECT o.id FROM sales.orders o;\n```", 25),
            "SELECT o.id FROM sales.orders o LIMIT 25"
        );
        assert_eq!(
            clean_generated_sql("SELECT o.id FROM sales.orders o LIMIT 3;", 25),
            "SELECT o.id FROM sales.orders o LIMIT 3"
        );
        assert_eq!(clean_generated_sql("  ;; ", 25), "");
    }

    #[test]
    fn test_clean_generated_sql_bounds_top_level_limit() {
        assert_eq!(
            clean_generated_sql("SELECT o.id FROM sales.orders o LIMIT 1000000", 25),
            "SELECT o.id FROM sales.orders o LIMIT 25"
        );
        assert_eq!(
            clean_generated_sql(
                "SELECT o.id FROM sales.orders o WHERE o.id IN (SELECT p.id FROM sales.orders p LIMIT 5)",
                25
            ),
            "SELECT o.id FROM sales.orders o WHERE o.id IN (SELECT p.id FROM sales.orders p LIMIT 5) LIMIT 25"
        );
    }

    #[test]
    fn test_extract_first_json_object() {
        let text = r#"Here you go: {"query_type": "find", "filter": {"note": "a } brace \" quote"}} trailing {"x": 1}"#;
        assert_eq!(
            extract_first_json_object(text),
            Some(r#"{"query_type": "find", "filter": {"note": "a } brace \" quote"}}"#)
        );
        assert_eq!(extract_first_json_object("no json here"), None);
        assert_eq!(extract_first_json_object("{\"unterminated\": 1"), None);
    }
}
