//! Dataset stages: registry-backed schema and `{table}` resolution

use super::Stage;
use crate::context::{GeneratedQuery, QueryContext};
use crate::error::{AppError, AppResult};
use crate::guard::{contains_placeholder, qualified_table_name, substitute_placeholder};
use crate::schema::{compute_join_hints, SchemaMap};
use crate::store::{DatasetEntry, DatasetRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

async fn lookup_dataset(
    registry: Option<&Arc<dyn DatasetRegistry>>,
    user_id: &str,
    dataset_id: &str,
) -> AppResult<DatasetEntry> {
    let registry = registry.ok_or_else(|| AppError::Resolution("no dataset registry configured".into()))?;

    match registry.lookup(user_id, dataset_id).await {
        Ok(Some(entry)) => Ok(entry),
        Ok(None) => Err(AppError::Resolution(format!(
            "Dataset '{}' not found for this user",
            dataset_id
        ))),
        Err(e) => {
            warn!(dataset_id, "Dataset registry lookup failed: {}", e);
            Err(AppError::Resolution(format!(
                "Could not look up dataset '{}': {}",
                dataset_id, e
            )))
        }
    }
}

fn require_user(ctx: &QueryContext) -> AppResult<String> {
    ctx.tenant
        .user_id
        .clone()
        .ok_or_else(|| AppError::Resolution("user id is required to resolve datasets".into()))
}

/// Fills the schema map from the selected datasets
pub struct DatasetSchemaStage {
    registry: Option<Arc<dyn DatasetRegistry>>,
}

impl DatasetSchemaStage {
    pub fn new(registry: Option<Arc<dyn DatasetRegistry>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for DatasetSchemaStage {
    fn name(&self) -> &'static str {
        "dataset_schema"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        let user_id = require_user(ctx)?;
        if ctx.selected_datasets.is_empty() {
            return Err(AppError::Resolution("no dataset selected".into()));
        }

        let mut tables = SchemaMap::new();
        let mut datasets = Vec::with_capacity(ctx.selected_datasets.len());
        for dataset_id in &ctx.selected_datasets {
            let entry = lookup_dataset(self.registry.as_ref(), &user_id, dataset_id).await?;
            tables.insert(entry.canonical_name(), entry.columns.clone());
            datasets.push(entry);
        }

        info!(
            request_id = %ctx.request_id,
            datasets = datasets.len(),
            "📦 Dataset schema loaded"
        );

        ctx.join_hints = compute_join_hints(&tables);
        ctx.tables = tables;
        ctx.datasets = datasets;
        Ok(())
    }
}

/// Replaces `{table}` with the first selected dataset's quoted table
pub struct PlaceholderResolutionStage {
    registry: Option<Arc<dyn DatasetRegistry>>,
}

impl PlaceholderResolutionStage {
    pub fn new(registry: Option<Arc<dyn DatasetRegistry>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for PlaceholderResolutionStage {
    fn name(&self) -> &'static str {
        "placeholder_resolution"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        let Some(sql) = ctx.generated_sql().filter(|sql| contains_placeholder(sql)) else {
            return Ok(());
        };
        let sql = sql.to_string();

        let user_id = require_user(ctx)?;
        let dataset_id = ctx
            .selected_datasets
            .first()
            .cloned()
            .ok_or_else(|| AppError::Resolution("no dataset selected for {table}".into()))?;

        let entry = match ctx.datasets.iter().find(|d| d.dataset_id == dataset_id) {
            Some(entry) => entry.clone(),
            None => lookup_dataset(self.registry.as_ref(), &user_id, &dataset_id).await?,
        };

        let resolved = substitute_placeholder(&sql, &qualified_table_name(&entry.schema_name, &entry.table_name));
        debug!(request_id = %ctx.request_id, sql = %resolved, "Resolved table placeholder");
        ctx.generated = Some(GeneratedQuery::Sql(resolved));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{PipelineController, PipelineKind};
    use super::*;
    use crate::config::QueryLimits;
    use crate::context::RunState;
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<dyn DatasetRegistry> {
        Arc::new(FakeRegistry::with_dataset("u1", "ds-1", "u_1", "sales_upload"))
    }

    fn dataset_context() -> QueryContext {
        QueryContext::new("amount by region", Some(10), QueryLimits::default())
            .with_tenant("u1", None)
            .with_selected_datasets(["ds-1"])
    }

    #[tokio::test]
    async fn test_dataset_schema_fills_tables() {
        let stage = DatasetSchemaStage::new(Some(registry()));
        let mut ctx = dataset_context();

        stage.apply(&mut ctx).await.unwrap();

        assert_eq!(ctx.tables.keys().collect::<Vec<_>>(), vec!["u_1.sales_upload"]);
        assert_eq!(ctx.datasets.len(), 1);
    }

    #[tokio::test]
    async fn test_dataset_schema_requires_user_and_selection() {
        let stage = DatasetSchemaStage::new(Some(registry()));

        let mut ctx = QueryContext::new("q", None, QueryLimits::default()).with_selected_datasets(["ds-1"]);
        assert_eq!(stage.apply(&mut ctx).await.unwrap_err().code(), "RESOLUTION_FAILED");

        let mut ctx = QueryContext::new("q", None, QueryLimits::default()).with_tenant("u1", None);
        assert_eq!(stage.apply(&mut ctx).await.unwrap_err().code(), "RESOLUTION_FAILED");
    }

    #[tokio::test]
    async fn test_dataset_of_other_user_is_not_found() {
        let stage = DatasetSchemaStage::new(Some(registry()));
        let mut ctx = dataset_context().with_tenant("u2", None);

        let err = stage.apply(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("ds-1"));
    }

    #[tokio::test]
    async fn test_placeholder_is_substituted_everywhere() {
        let stage = PlaceholderResolutionStage::new(Some(registry()));
        let mut ctx = dataset_context();
        ctx.generated = Some(GeneratedQuery::Sql(
            "SELECT t.region FROM {table} t WHERE t.amount > (SELECT avg(s.amount) FROM {table} s)".into(),
        ));

        stage.apply(&mut ctx).await.unwrap();

        assert_eq!(
            ctx.generated_sql(),
            Some(
                "SELECT t.region FROM \"u_1\".\"sales_upload\" t WHERE t.amount > (SELECT avg(s.amount) FROM \"u_1\".\"sales_upload\" s)"
            )
        );
    }

    #[tokio::test]
    async fn test_placeholder_without_placeholder_is_noop() {
        let stage = PlaceholderResolutionStage::new(None);
        let mut ctx = QueryContext::new("q", None, QueryLimits::default());
        ctx.generated = Some(GeneratedQuery::Sql("SELECT o.id FROM sales.orders o".into()));

        stage.apply(&mut ctx).await.unwrap();
        assert_eq!(ctx.generated_sql(), Some("SELECT o.id FROM sales.orders o"));
    }

    #[tokio::test]
    async fn test_placeholder_registry_failure_is_resolution_error() {
        let failing: Arc<dyn DatasetRegistry> = Arc::new(FakeRegistry {
            fail: true,
            ..FakeRegistry::default()
        });
        let stage = PlaceholderResolutionStage::new(Some(failing));
        let mut ctx = dataset_context();
        ctx.generated = Some(GeneratedQuery::Sql("SELECT t.region FROM {table} t".into()));

        let err = stage.apply(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), "RESOLUTION_FAILED");
        assert!(err.to_string().contains("registry offline"));
    }

    #[test]
    fn test_dataset_run_end_to_end() {
        let store = Arc::new(FakeRelationalStore::new(SchemaMap::new()));
        let generator = Arc::new(ScriptedGenerator::new(["SELECT t.region, t.amount FROM {table} t"]));
        let controller = PipelineController::new(generator.clone()).with_dataset_registry(registry());

        let ctx = dataset_context().with_relational_store(store.clone());
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Dataset, ctx));

        assert_eq!(ctx.state, RunState::Succeeded);
        assert_eq!(
            store.executed(),
            vec!["SELECT t.region, t.amount FROM \"u_1\".\"sales_upload\" t LIMIT 10".to_string()]
        );
        assert_eq!(ctx.tables_used, vec!["u_1.sales_upload".to_string()]);
        assert!(generator.requests.lock().unwrap()[0].uses_placeholder);
    }
}
