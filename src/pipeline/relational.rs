//! Relational stages: schema discovery, SQL generation, guard, execution

use super::generation::{clean_generated_sql, GenerationRequest, GenerationTarget, QueryGenerator};
use super::Stage;
use crate::context::{GeneratedQuery, QueryContext};
use crate::error::{AppError, AppResult};
use crate::guard::{enforce_row_limit, ensure_safe_select, RelationalAllowList, SqlGuard};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Loads tables, categorical hints and join hints from the relational store
pub struct SchemaDiscoveryStage;

#[async_trait]
impl Stage for SchemaDiscoveryStage {
    fn name(&self) -> &'static str {
        "schema_discovery"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        let store = ctx
            .relational
            .clone()
            .ok_or_else(|| AppError::NotConnected("no relational store configured".into()))?;

        let schema = store.discover_schema().await?;
        if schema.tables.is_empty() {
            return Err(AppError::Resolution(
                "No queryable tables found in the connected database".into(),
            ));
        }

        info!(
            request_id = %ctx.request_id,
            tables = schema.tables.len(),
            "🔍 Schema discovered"
        );

        ctx.tables = schema.tables;
        ctx.categorical_values = schema.categorical_values;
        ctx.join_hints = schema.join_hints;
        Ok(())
    }
}

/// Asks the generator for SQL and tidies its output
pub struct SqlGenerationStage {
    generator: Arc<dyn QueryGenerator>,
    uses_placeholder: bool,
}

impl SqlGenerationStage {
    pub fn new(generator: Arc<dyn QueryGenerator>) -> Self {
        Self {
            generator,
            uses_placeholder: false,
        }
    }

    /// Ask for `{table}` in place of the selected dataset's name
    pub fn with_placeholder(mut self) -> Self {
        self.uses_placeholder = true;
        self
    }

    fn request(&self, ctx: &QueryContext) -> GenerationRequest {
        let mut request = GenerationRequest::new(GenerationTarget::Sql, ctx.question.trim(), ctx.limit);
        request.tables = ctx.tables.clone();
        request.categorical_values = ctx.categorical_values.clone();
        request.join_hints = ctx.join_hints.iter().map(ToString::to_string).collect();
        request.uses_placeholder = self.uses_placeholder;
        request
    }
}

#[async_trait]
impl Stage for SqlGenerationStage {
    fn name(&self) -> &'static str {
        "sql_generation"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        if ctx.question.trim().is_empty() {
            return Err(AppError::Validation("Question must not be empty".into()));
        }
        if ctx.tables.is_empty() {
            return Err(AppError::Generation("no schema available to query".into()));
        }

        let raw = self.generator.generate(&self.request(ctx)).await?;
        let sql = clean_generated_sql(&raw, ctx.limit);
        if sql.is_empty() {
            return Err(AppError::Generation("generator returned no SQL".into()));
        }

        debug!(request_id = %ctx.request_id, sql = %sql, "Generated SQL");
        ctx.generated = Some(GeneratedQuery::Sql(sql));
        Ok(())
    }
}

/// Runs the guard over the generated statement
pub struct SqlSafetyStage;

#[async_trait]
impl Stage for SqlSafetyStage {
    fn name(&self) -> &'static str {
        "sql_safety"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        let sql = ctx
            .generated_sql()
            .ok_or_else(|| AppError::Internal("no SQL to check".into()))?
            .to_string();

        let allowed = RelationalAllowList::from_schema(&ctx.tables);
        let safe_sql = if allowed.is_empty() {
            warn!(
                request_id = %ctx.request_id,
                "Empty allow-list, skipping table and column validation"
            );
            ctx.degraded = true;
            ctx.warn("Table and column validation skipped: no schema allow-list available");
            ensure_safe_select(&sql)?
        } else {
            let validated = SqlGuard::new(allowed).validate(&sql)?;
            if validated.limit_repaired {
                ctx.warn("Duplicate LIMIT clauses were collapsed into the last one");
            }
            ctx.tables_used = validated.tables_used;
            validated.sql
        };

        let safe_sql = enforce_row_limit(&safe_sql, ctx.limit);
        debug!(request_id = %ctx.request_id, sql = %safe_sql, "SQL passed guard");
        ctx.generated = Some(GeneratedQuery::Sql(safe_sql));
        ctx.safety_passed = true;
        Ok(())
    }
}

/// Executes guarded SQL against the relational store
pub struct SqlExecutionStage;

#[async_trait]
impl Stage for SqlExecutionStage {
    fn name(&self) -> &'static str {
        "sql_execution"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        if !ctx.safety_passed {
            return Err(AppError::Internal("refusing to execute unchecked SQL".into()));
        }
        let sql = ctx
            .generated_sql()
            .ok_or_else(|| AppError::Internal("no SQL to execute".into()))?
            .to_string();
        let store = ctx
            .relational
            .clone()
            .ok_or_else(|| AppError::NotConnected("no relational store configured".into()))?;

        let timeout = Duration::from_millis(ctx.limits.statement_timeout_ms);
        let started = Instant::now();
        let rows = store.fetch_rows(&sql, timeout).await?;
        let elapsed = started.elapsed().as_millis() as u64;

        info!(
            request_id = %ctx.request_id,
            rows = rows.rows.len(),
            elapsed_ms = elapsed,
            "⚡ SQL executed"
        );

        ctx.execution_time_ms = Some(elapsed);
        ctx.columns = rows.columns;
        ctx.results = rows.rows;
        Ok(())
    }
}
