//! Per-request query context
//!
//! One [`QueryContext`] is created per request and threaded by value through every
//! pipeline stage. It carries the tenant scope, store handles, discovered
//! allow-lists, the generated query, results and the single terminal error slot.

use crate::config::QueryLimits;
use crate::document::{DateField, FieldAllowList, QuerySpec};
use crate::error::{AppError, ErrorCategory, ErrorResponse};
use crate::schema::{CategoricalHints, JoinHint, SchemaMap};
use crate::store::{DatasetEntry, DocumentStore, RelationalStore, Row};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Who the request runs for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
}

/// Query produced by the generator
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedQuery {
    Sql(String),
    Document(QuerySpec),
}

impl GeneratedQuery {
    /// Text form, as logged and recorded in history
    pub fn render(&self) -> String {
        match self {
            GeneratedQuery::Sql(sql) => sql.clone(),
            GeneratedQuery::Document(spec) => spec.to_value().to_string(),
        }
    }
}

/// Run progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    StageComplete { index: usize, stage: String },
    Failed { stage: String },
    Succeeded,
}

/// The error that ended a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalError {
    pub stage: String,
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
}

impl TerminalError {
    pub fn from_error(stage: &str, error: &AppError) -> Self {
        Self {
            stage: stage.to_string(),
            code: error.code().to_string(),
            category: error.category(),
            message: error.to_string(),
        }
    }
}

impl From<&TerminalError> for ErrorResponse {
    fn from(err: &TerminalError) -> Self {
        ErrorResponse {
            success: false,
            message: err.message.clone(),
            code: err.code.clone(),
            category: err.category,
            stage: Some(err.stage.clone()),
        }
    }
}

/// Document collection targeted by a document run
#[derive(Clone)]
pub struct DocumentTarget {
    pub store: Arc<dyn DocumentStore>,
    pub collection: String,
}

/// Everything one request accumulates on its way through a pipeline
#[derive(Clone)]
pub struct QueryContext {
    pub request_id: Uuid,
    pub tenant: Tenant,
    pub question: String,
    /// Row limit, already clamped
    pub limit: u32,
    pub limits: QueryLimits,

    pub relational: Option<Arc<dyn RelationalStore>>,
    pub document: Option<DocumentTarget>,

    pub tables: SchemaMap,
    pub categorical_values: CategoricalHints,
    pub join_hints: Vec<JoinHint>,
    pub selected_datasets: Vec<String>,
    pub datasets: Vec<DatasetEntry>,

    pub field_allow_list: FieldAllowList,
    pub date_field: Option<DateField>,

    pub generated: Option<GeneratedQuery>,
    pub safety_passed: bool,
    pub degraded: bool,
    pub warnings: Vec<String>,

    pub results: Vec<Row>,
    pub columns: Vec<String>,
    pub tables_used: Vec<String>,

    pub error: Option<TerminalError>,
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("request_id", &self.request_id)
            .field("tenant", &self.tenant)
            .field("question", &self.question)
            .field("limit", &self.limit)
            .field("tables", &self.tables.len())
            .field("generated", &self.generated)
            .field("safety_passed", &self.safety_passed)
            .field("results", &self.results.len())
            .field("error", &self.error)
            .field("state", &self.state)
            .finish()
    }
}

impl QueryContext {
    /// Fresh context; `requested_limit` is clamped against `limits`
    pub fn new(question: impl Into<String>, requested_limit: Option<i64>, limits: QueryLimits) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            tenant: Tenant::default(),
            question: question.into(),
            limit: limits.clamp_row_limit(requested_limit),
            limits,
            relational: None,
            document: None,
            tables: SchemaMap::new(),
            categorical_values: CategoricalHints::new(),
            join_hints: Vec::new(),
            selected_datasets: Vec::new(),
            datasets: Vec::new(),
            field_allow_list: FieldAllowList::new(),
            date_field: None,
            generated: None,
            safety_passed: false,
            degraded: false,
            warnings: Vec::new(),
            results: Vec::new(),
            columns: Vec::new(),
            tables_used: Vec::new(),
            error: None,
            state: RunState::NotStarted,
            started_at: None,
            finished_at: None,
            execution_time_ms: None,
        }
    }

    pub fn with_tenant(mut self, user_id: impl Into<String>, workspace_id: Option<String>) -> Self {
        self.tenant = Tenant {
            user_id: Some(user_id.into()),
            workspace_id,
        };
        self
    }

    pub fn with_relational_store(mut self, store: Arc<dyn RelationalStore>) -> Self {
        self.relational = Some(store);
        self
    }

    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        self.document = Some(DocumentTarget {
            store,
            collection: collection.into(),
        });
        self
    }

    pub fn with_selected_datasets<I, S>(mut self, datasets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected_datasets = datasets.into_iter().map(Into::into).collect();
        self
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Generated SQL, if the generator produced SQL
    pub fn generated_sql(&self) -> Option<&str> {
        match &self.generated {
            Some(GeneratedQuery::Sql(sql)) => Some(sql),
            _ => None,
        }
    }

    pub fn generated_spec(&self) -> Option<&QuerySpec> {
        match &self.generated {
            Some(GeneratedQuery::Document(spec)) => Some(spec),
            _ => None,
        }
    }

    /// Record the terminal error; partial results are discarded
    pub fn fail(&mut self, stage: &str, error: &AppError) {
        self.error = Some(TerminalError::from_error(stage, error));
        self.results.clear();
        self.columns.clear();
        self.state = RunState::Failed {
            stage: stage.to_string(),
        };
    }

    /// Serializable summary for the caller
    pub fn outcome(&self) -> QueryOutcome {
        QueryOutcome {
            request_id: self.request_id,
            success: self.error.is_none() && self.state == RunState::Succeeded,
            query: self.generated.as_ref().map(GeneratedQuery::render),
            columns: self.columns.clone(),
            rows: self.results.clone(),
            row_count: self.results.len(),
            tables_used: self.tables_used.clone(),
            warnings: self.warnings.clone(),
            degraded: self.degraded,
            execution_time_ms: self.execution_time_ms,
            error: self.error.as_ref().map(ErrorResponse::from),
        }
    }
}

/// What a finished run reports
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub tables_used: Vec<String>,
    pub warnings: Vec<String>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::SqlGuardError;
    use serde_json::json;

    #[test]
    fn test_new_context_clamps_limit() {
        let ctx = QueryContext::new("q", Some(10_000), QueryLimits::default());
        assert_eq!(ctx.limit, 500);
        assert_eq!(ctx.state, RunState::NotStarted);
        assert!(!ctx.is_failed());
    }

    #[test]
    fn test_fail_clears_results() {
        let mut ctx = QueryContext::new("q", None, QueryLimits::default());
        let mut row = Row::new();
        row.insert("id".into(), json!(1));
        ctx.results.push(row);
        ctx.columns.push("id".into());

        let err = AppError::from(SqlGuardError::NoTableFound);
        ctx.fail("sql_safety", &err);

        assert!(ctx.results.is_empty());
        assert!(ctx.columns.is_empty());
        assert_eq!(ctx.state, RunState::Failed { stage: "sql_safety".into() });

        let outcome = ctx.outcome();
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.code, "NO_TABLE_FOUND");
        assert_eq!(error.stage.as_deref(), Some("sql_safety"));
    }
}
