//! Post-processing stage that records successful runs

use super::Stage;
use crate::context::QueryContext;
use crate::error::AppResult;
use crate::store::{HistoryEntry, QueryHistory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Appends the run to the user's query history.
///
/// Anonymous runs are skipped. A failed write is reported as a warning and
/// never fails the run.
pub struct QueryHistoryStage {
    history: Arc<dyn QueryHistory>,
}

impl QueryHistoryStage {
    pub fn new(history: Arc<dyn QueryHistory>) -> Self {
        Self { history }
    }

    fn entry(ctx: &QueryContext) -> Option<HistoryEntry> {
        let user_id = ctx.tenant.user_id.clone()?;
        let query_text = ctx.generated.as_ref()?.render();
        Some(HistoryEntry {
            user_id,
            workspace_id: ctx.tenant.workspace_id.clone(),
            question: ctx.question.clone(),
            query_text,
            selected_datasets: ctx.selected_datasets.clone(),
            row_count: ctx.results.len(),
            execution_time_ms: ctx.execution_time_ms,
        })
    }
}

#[async_trait]
impl Stage for QueryHistoryStage {
    fn name(&self) -> &'static str {
        "query_history"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        let Some(entry) = Self::entry(ctx) else {
            debug!(request_id = %ctx.request_id, "Skipping history for anonymous run");
            return Ok(());
        };

        if let Err(e) = self.history.record(&entry).await {
            warn!(request_id = %ctx.request_id, "Failed to record query history: {}", e);
            ctx.warn("Query history could not be saved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{PipelineController, PipelineKind};
    use super::*;
    use crate::config::QueryLimits;
    use crate::context::{GeneratedQuery, RunState};
    use crate::error::AppError;
    use pretty_assertions::assert_eq;

    struct BrokenHistory;

    #[async_trait]
    impl QueryHistory for BrokenHistory {
        async fn record(&self, _entry: &HistoryEntry) -> AppResult<()> {
            Err(AppError::NotConnected("history table missing".into()))
        }
    }

    #[tokio::test]
    async fn test_anonymous_runs_are_not_recorded() {
        let history = Arc::new(RecordingHistory::default());
        let stage = QueryHistoryStage::new(history.clone());
        let mut ctx = QueryContext::new("q", None, QueryLimits::default());
        ctx.generated = Some(GeneratedQuery::Sql("SELECT 1".into()));

        stage.apply(&mut ctx).await.unwrap();

        assert!(history.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_is_a_warning() {
        let stage = QueryHistoryStage::new(Arc::new(BrokenHistory));
        let mut ctx = QueryContext::new("q", None, QueryLimits::default()).with_tenant("u1", None);
        ctx.generated = Some(GeneratedQuery::Sql("SELECT 1".into()));

        stage.apply(&mut ctx).await.unwrap();

        assert_eq!(ctx.warnings, vec!["Query history could not be saved".to_string()]);
    }

    #[test]
    fn test_successful_run_is_recorded() {
        let history = Arc::new(RecordingHistory::default());
        let store = Arc::new(FakeRelationalStore::new(orders_schema()));
        let generator = Arc::new(ScriptedGenerator::new(["SELECT o.region, o.total FROM sales.orders o"]));
        let controller = PipelineController::new(generator)
            .with_post_stage(Arc::new(QueryHistoryStage::new(history.clone())));

        let ctx = QueryContext::new("totals", Some(5), QueryLimits::default())
            .with_tenant("u1", Some("ws-9".into()))
            .with_relational_store(store);
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Relational, ctx));

        assert_eq!(ctx.state, RunState::Succeeded);
        let entries = history.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].workspace_id.as_deref(), Some("ws-9"));
        assert_eq!(entries[0].query_text, "SELECT o.region, o.total FROM sales.orders o LIMIT 5");
        assert_eq!(entries[0].row_count, 2);
    }

    #[test]
    fn test_failed_run_is_not_recorded() {
        let history = Arc::new(RecordingHistory::default());
        let store = Arc::new(FakeRelationalStore::new(orders_schema()));
        let generator = Arc::new(ScriptedGenerator::new(["DROP TABLE sales.orders"]));
        let controller = PipelineController::new(generator)
            .with_post_stage(Arc::new(QueryHistoryStage::new(history.clone())));

        let ctx = QueryContext::new("drop it", None, QueryLimits::default())
            .with_tenant("u1", None)
            .with_relational_store(store);
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Relational, ctx));

        assert!(ctx.is_failed());
        assert!(history.entries.lock().unwrap().is_empty());
    }
}
