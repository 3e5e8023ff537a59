//! Document stages: field discovery, spec generation, validation, execution

use super::generation::{extract_first_json_object, GenerationRequest, GenerationTarget, QueryGenerator};
use super::Stage;
use crate::context::{DocumentTarget, GeneratedQuery, QueryContext};
use crate::document::{
    detect_date_field, profile_documents, strip_meta_keys, validate_fields, DocumentQueryValidator,
    FieldAllowList, QuerySpec,
};
use crate::error::{AppError, AppResult};
use crate::store::Row;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn document_target(ctx: &QueryContext) -> AppResult<DocumentTarget> {
    ctx.document
        .clone()
        .ok_or_else(|| AppError::NotConnected("no document store configured".into()))
}

/// Samples the collection into a field allow-list and date field
pub struct FieldDiscoveryStage;

#[async_trait]
impl Stage for FieldDiscoveryStage {
    fn name(&self) -> &'static str {
        "field_discovery"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        let target = document_target(ctx)?;
        let sample = target
            .store
            .sample(&target.collection, ctx.limits.field_sample_size)
            .await?;

        let profiles = profile_documents(&sample);
        ctx.field_allow_list = FieldAllowList::from_profiles(&profiles);
        ctx.date_field = detect_date_field(&profiles);

        if ctx.field_allow_list.is_trivial() {
            warn!(
                request_id = %ctx.request_id,
                collection = %target.collection,
                "No fields discovered, field validation will be skipped"
            );
            ctx.degraded = true;
            ctx.warn(format!(
                "Field validation skipped: no fields discovered in '{}'",
                target.collection
            ));
        }

        info!(
            request_id = %ctx.request_id,
            collection = %target.collection,
            sampled = sample.len(),
            fields = ctx.field_allow_list.len(),
            date_field = ?ctx.date_field,
            "🔍 Fields discovered"
        );
        Ok(())
    }
}

/// Asks the generator for a query spec, with one repair attempt
pub struct DocumentGenerationStage {
    generator: Arc<dyn QueryGenerator>,
}

impl DocumentGenerationStage {
    pub fn new(generator: Arc<dyn QueryGenerator>) -> Self {
        Self { generator }
    }

    fn request(&self, ctx: &QueryContext) -> GenerationRequest {
        let mut request =
            GenerationRequest::new(GenerationTarget::DocumentSpec, ctx.question.trim(), ctx.limit);
        request.collection = ctx.document.as_ref().map(|d| d.collection.clone());
        request.fields = ctx.field_allow_list.paths().map(String::from).collect();
        request.date_field = ctx.date_field.as_ref().map(|field| field.path.clone());
        request.lookback_days = ctx.limits.date_lookback_days;
        request
    }
}

fn parse_json_object(raw: &str) -> Option<Value> {
    let candidate = extract_first_json_object(raw)?;
    serde_json::from_str(candidate).ok()
}

#[async_trait]
impl Stage for DocumentGenerationStage {
    fn name(&self) -> &'static str {
        "document_generation"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        if ctx.question.trim().is_empty() {
            return Err(AppError::Validation("Question must not be empty".into()));
        }

        let mut request = self.request(ctx);
        let raw = self.generator.generate(&request).await?;

        let value = match parse_json_object(&raw) {
            Some(value) => value,
            None => {
                warn!(request_id = %ctx.request_id, "Generator output had no JSON object, retrying once");
                request.previous_invalid_output = Some(raw);
                let retry = self.generator.generate(&request).await?;
                parse_json_object(&retry).ok_or_else(|| {
                    AppError::Generation("output did not contain a valid JSON object".into())
                })?
            }
        };

        let spec = QuerySpec::from_value(&value, ctx.limit as i64)?;
        debug!(request_id = %ctx.request_id, spec = %value, "Generated query spec");
        ctx.generated = Some(GeneratedQuery::Document(spec));
        Ok(())
    }
}

/// Validates and normalizes the generated spec.
///
/// The default stage builds its validator from each request's limits.
#[derive(Default)]
pub struct DocumentValidationStage {
    validator: Option<DocumentQueryValidator>,
}

impl DocumentValidationStage {
    pub fn new(validator: DocumentQueryValidator) -> Self {
        Self {
            validator: Some(validator),
        }
    }
}

#[async_trait]
impl Stage for DocumentValidationStage {
    fn name(&self) -> &'static str {
        "document_validation"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        let mut spec = ctx
            .generated_spec()
            .cloned()
            .ok_or_else(|| AppError::Internal("no query spec to validate".into()))?;

        let validator = self
            .validator
            .clone()
            .unwrap_or_else(|| DocumentQueryValidator::from_limits(&ctx.limits));

        let stripped = strip_meta_keys(&mut spec);
        if stripped > 0 {
            debug!(request_id = %ctx.request_id, stripped, "Removed misplaced meta keys");
        }

        validator.validate(&spec)?;

        if ctx.field_allow_list.is_trivial() {
            if !ctx.degraded {
                warn!(request_id = %ctx.request_id, "Empty field allow-list, skipping field validation");
                ctx.degraded = true;
                ctx.warn("Field validation skipped: no field allow-list available");
            }
        } else {
            validate_fields(&spec, &ctx.field_allow_list)?;
        }

        let injected = validator.enforce_date_filter(
            &mut spec,
            ctx.date_field.as_ref(),
            ctx.limits.date_lookback_days,
            &ctx.question,
            Utc::now(),
        );
        if injected {
            ctx.warn(format!(
                "Restricted to the last {} days",
                ctx.limits.date_lookback_days
            ));
        }

        let effective = validator.enforce_limit(&mut spec, ctx.limit as i64);
        ctx.limit = effective;
        ctx.generated = Some(GeneratedQuery::Document(spec));
        ctx.safety_passed = true;
        Ok(())
    }
}

/// Runs the validated spec against the document store
pub struct DocumentExecutionStage;

#[async_trait]
impl Stage for DocumentExecutionStage {
    fn name(&self) -> &'static str {
        "document_execution"
    }

    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()> {
        if !ctx.safety_passed {
            return Err(AppError::Internal("refusing to execute an unchecked spec".into()));
        }
        let spec = ctx
            .generated_spec()
            .cloned()
            .ok_or_else(|| AppError::Internal("no query spec to execute".into()))?;
        let target = document_target(ctx)?;

        let timeout = Duration::from_millis(ctx.limits.statement_timeout_ms);
        let started = Instant::now();
        let run = async {
            match &spec {
                QuerySpec::Find {
                    filter,
                    projection,
                    sort,
                    limit,
                } => {
                    target
                        .store
                        .find(
                            &target.collection,
                            filter,
                            projection.as_ref(),
                            sort.as_ref(),
                            (*limit).max(1) as u32,
                        )
                        .await
                }
                QuerySpec::Aggregate { pipeline, .. } => {
                    target.store.aggregate(&target.collection, pipeline).await
                }
            }
        };

        let rows = tokio::time::timeout(timeout, run).await.map_err(|_| {
            AppError::Timeout(format!("no result within {} ms", timeout.as_millis()))
        })??;
        let elapsed = started.elapsed().as_millis() as u64;

        info!(
            request_id = %ctx.request_id,
            query_type = spec.query_type(),
            rows = rows.len(),
            elapsed_ms = elapsed,
            "⚡ Document query executed"
        );

        ctx.execution_time_ms = Some(elapsed);
        ctx.columns = column_names(&rows);
        ctx.results = rows;
        Ok(())
    }
}

/// Keys across all rows, in first-seen order
fn column_names(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for key in rows.iter().flat_map(|row| row.keys()) {
        if !columns.iter().any(|c| c == key) {
            columns.push(key.clone());
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{PipelineController, PipelineKind};
    use super::*;
    use crate::config::QueryLimits;
    use crate::context::RunState;
    use crate::document::DateField;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn orders() -> Vec<Value> {
        vec![
            json!({"_id": {"$oid": "a1"}, "region": "west", "total": 10,
                   "created_at": {"$date": "2024-05-01T00:00:00Z"}, "items": [{"price": 2}]}),
            json!({"_id": {"$oid": "a2"}, "region": "east", "total": 4,
                   "created_at": {"$date": "2024-05-03T00:00:00Z"}, "items": []}),
        ]
    }

    fn document_context(store: Arc<FakeDocumentStore>, question: &str) -> QueryContext {
        QueryContext::new(question, Some(20), QueryLimits::default()).with_document_store(store, "orders")
    }

    #[tokio::test]
    async fn test_field_discovery_builds_allow_list() {
        let store = Arc::new(FakeDocumentStore::new(orders()));
        let mut ctx = document_context(store, "q");

        FieldDiscoveryStage.apply(&mut ctx).await.unwrap();

        assert!(ctx.field_allow_list.permits("items.price"));
        assert!(ctx.field_allow_list.permits("_id"));
        assert_eq!(ctx.date_field, Some(DateField::native("created_at")));
        assert!(!ctx.degraded);
    }

    #[tokio::test]
    async fn test_field_discovery_on_empty_collection_degrades() {
        let store = Arc::new(FakeDocumentStore::new(Vec::new()));
        let mut ctx = document_context(store, "q");

        FieldDiscoveryStage.apply(&mut ctx).await.unwrap();

        assert!(ctx.degraded);
        assert!(ctx.field_allow_list.is_trivial());
        assert_eq!(ctx.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_generation_retries_once_with_invalid_output() {
        let generator = Arc::new(ScriptedGenerator::new([
            "Sure! Here's the query: find orders in the west",
            r#"```json
{"query_type": "find", "filter": {"region": "west"}}
```"#,
        ]));
        let stage = DocumentGenerationStage::new(generator.clone());
        let mut ctx = document_context(Arc::new(FakeDocumentStore::new(orders())), "west orders");

        stage.apply(&mut ctx).await.unwrap();

        assert_eq!(generator.calls(), 2);
        let requests = generator.requests.lock().unwrap();
        assert_eq!(requests[0].previous_invalid_output, None);
        assert!(requests[1].previous_invalid_output.as_deref().unwrap().contains("Sure!"));
        assert_eq!(requests[1].collection.as_deref(), Some("orders"));
        assert_eq!(ctx.generated_spec().unwrap().query_type(), "find");
    }

    #[tokio::test]
    async fn test_generation_fails_after_second_invalid_output() {
        let generator = Arc::new(ScriptedGenerator::new(["nope", "{\"broken\": "]));
        let stage = DocumentGenerationStage::new(generator.clone());
        let mut ctx = document_context(Arc::new(FakeDocumentStore::new(orders())), "west orders");

        let err = stage.apply(&mut ctx).await.unwrap_err();

        assert_eq!(err.code(), "GENERATION_FAILED");
        assert_eq!(generator.calls(), 2);
        assert!(ctx.generated.is_none());
    }

    #[tokio::test]
    async fn test_validation_strips_meta_keys_and_clamps_limit() {
        let validator = DocumentQueryValidator::default();
        let stage = DocumentValidationStage::new(validator);
        let mut ctx = QueryContext::new("orders by region", Some(500), QueryLimits::default());
        ctx.field_allow_list = FieldAllowList::from_paths(["region", "total"]);
        ctx.generated = Some(GeneratedQuery::Document(QuerySpec::Find {
            filter: json!({"region": "west", "limit": 5}).as_object().cloned().unwrap(),
            projection: None,
            sort: None,
            limit: 1000,
        }));

        stage.apply(&mut ctx).await.unwrap();

        let spec = ctx.generated_spec().unwrap();
        assert_eq!(spec.limit(), 200);
        assert_eq!(spec.to_value()["filter"], json!({"region": "west"}));
        assert!(ctx.safety_passed);
    }

    #[tokio::test]
    async fn test_validation_rejects_unknown_field() {
        let stage = DocumentValidationStage::new(DocumentQueryValidator::default());
        let mut ctx = QueryContext::new("q", None, QueryLimits::default());
        ctx.field_allow_list = FieldAllowList::from_paths(["region"]);
        ctx.generated = Some(GeneratedQuery::Document(QuerySpec::Find {
            filter: json!({"password": {"$exists": true}}).as_object().cloned().unwrap(),
            projection: None,
            sort: None,
            limit: 10,
        }));

        let err = stage.apply(&mut ctx).await.unwrap_err();

        assert_eq!(err.code(), "UNKNOWN_FIELD");
        assert!(!ctx.safety_passed);
    }

    #[tokio::test]
    async fn test_validation_injects_date_window() {
        let stage = DocumentValidationStage::new(DocumentQueryValidator::default());
        let mut ctx = QueryContext::new("revenue over the last weeks", None, QueryLimits::default());
        ctx.field_allow_list = FieldAllowList::from_paths(["region", "created_at"]);
        ctx.date_field = Some(DateField::native("created_at"));
        ctx.generated = Some(GeneratedQuery::Document(QuerySpec::Aggregate {
            pipeline: vec![json!({"$group": {"_id": "$region", "revenue": {"$sum": 1}}})],
            limit: 10,
        }));

        stage.apply(&mut ctx).await.unwrap();

        let QuerySpec::Aggregate { pipeline, .. } = ctx.generated_spec().unwrap() else {
            panic!("expected aggregate");
        };
        assert!(pipeline[0]["$match"]["created_at"]["$gte"]["$date"].is_string());
        assert_eq!(pipeline.last().unwrap(), &json!({"$limit": 50}));
        assert_eq!(ctx.warnings, vec!["Restricted to the last 90 days".to_string()]);
    }

    #[tokio::test]
    async fn test_execution_requires_safety_pass() {
        let store = Arc::new(FakeDocumentStore::new(orders()));
        let mut ctx = document_context(store.clone(), "q");
        ctx.generated = Some(GeneratedQuery::Document(QuerySpec::Find {
            filter: Default::default(),
            projection: None,
            sort: None,
            limit: 1,
        }));

        let err = DocumentExecutionStage.apply(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(store.finds.lock().unwrap().is_empty());

        ctx.safety_passed = true;
        DocumentExecutionStage.apply(&mut ctx).await.unwrap();
        assert_eq!(ctx.results.len(), 1);
        assert_eq!(ctx.columns[0], "_id");
    }

    #[test]
    fn test_document_run_end_to_end() {
        let store = Arc::new(FakeDocumentStore::new(orders()));
        let generator = Arc::new(ScriptedGenerator::new([
            r#"{"query_type": "aggregate", "pipeline": [
                {"$unwind": "$items"},
                {"$group": {"_id": "$region", "revenue": {"$sum": "$items.price"}}},
                {"$sort": {"revenue": -1}}
            ]}"#,
        ]));
        let controller = PipelineController::new(generator);

        let ctx = document_context(store.clone(), "revenue by region");
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Document, ctx));

        assert_eq!(ctx.state, RunState::Succeeded);
        let executed = store.aggregates.lock().unwrap();
        assert_eq!(executed[0].len(), 4);
        assert_eq!(executed[0][3], json!({"$limit": 20}));
        assert_eq!(ctx.columns, vec!["_id".to_string(), "revenue".to_string()]);
    }

    #[test]
    fn test_document_run_filters_native_dates_as_dates() {
        let store = Arc::new(FakeDocumentStore::new(orders()));
        let generator = Arc::new(ScriptedGenerator::new([r#"{"query_type": "find", "filter": {"region": "west"}}"#]));
        let controller = PipelineController::new(generator);

        let ctx = document_context(store.clone(), "west orders in the last days");
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Document, ctx));

        assert_eq!(ctx.state, RunState::Succeeded);
        let finds = store.finds.lock().unwrap();
        let bound = &finds[0].0["created_at"]["$gte"];
        assert!(bound.is_object());
        assert!(bound["$date"].is_string());
        assert_eq!(finds[0].0["region"], json!("west"));
    }

    #[test]
    fn test_document_run_honours_configured_limits() {
        let store = Arc::new(FakeDocumentStore::new(orders()));
        let generator = Arc::new(ScriptedGenerator::new([r#"{"query_type": "find", "filter": {}}"#]));
        let controller = PipelineController::new(generator);
        let limits = QueryLimits {
            max_document_limit: 5,
            ..QueryLimits::default()
        };

        let ctx = QueryContext::new("orders by region", Some(100), limits).with_document_store(store.clone(), "orders");
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Document, ctx));

        assert_eq!(ctx.state, RunState::Succeeded);
        assert_eq!(store.finds.lock().unwrap()[0].1, 5);
        assert_eq!(ctx.generated_spec().unwrap().limit(), 5);
    }

    #[test]
    fn test_document_run_honours_configured_stage_count() {
        let store = Arc::new(FakeDocumentStore::new(orders()));
        let generator = Arc::new(ScriptedGenerator::new([
            r#"{"query_type": "aggregate", "pipeline": [{"$match": {}}, {"$sort": {"total": -1}}, {"$limit": 3}]}"#,
        ]));
        let controller = PipelineController::new(generator);
        let limits = QueryLimits {
            max_pipeline_stages: 2,
            ..QueryLimits::default()
        };

        let ctx = QueryContext::new("top orders", None, limits).with_document_store(store.clone(), "orders");
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Document, ctx));

        assert_eq!(ctx.error.as_ref().unwrap().code, "PIPELINE_TOO_LONG");
        assert!(store.aggregates.lock().unwrap().is_empty());
    }

    #[test]
    fn test_document_run_blocks_lookup_stage() {
        let store = Arc::new(FakeDocumentStore::new(orders()));
        let generator = Arc::new(ScriptedGenerator::new([
            r#"{"query_type": "aggregate", "pipeline": [
                {"$lookup": {"from": "users", "localField": "user_id", "foreignField": "_id", "as": "u"}}
            ]}"#,
        ]));
        let controller = PipelineController::new(generator);

        let ctx = document_context(store.clone(), "orders with users");
        let ctx = tokio_test::block_on(controller.run(PipelineKind::Document, ctx));

        let error = ctx.error.as_ref().unwrap();
        assert_eq!(error.stage, "document_validation");
        assert_eq!(error.code, "DISALLOWED_STAGE");
        assert!(store.aggregates.lock().unwrap().is_empty());
    }
}
