//! Query Pipeline Module
//!
//! Sequences discovery, generation, validation and execution stages over one
//! [`QueryContext`]. Three kinds share a common post-processing suffix:
//!
//! 1. **Relational**: schema discovery, SQL generation, SQL safety, SQL execution
//! 2. **Dataset**: dataset schema, SQL generation, `{table}` resolution, SQL safety,
//!    SQL execution
//! 3. **Document**: field discovery, spec generation, spec validation, spec execution
//!
//! A stage either hands the context back or halts with an error. The first halt
//! ends the run: the error is recorded, results are cleared and no later stage runs.

pub mod dataset;
pub mod document;
pub mod generation;
pub mod history;
pub mod relational;

pub use dataset::{DatasetSchemaStage, PlaceholderResolutionStage};
pub use document::{DocumentExecutionStage, DocumentGenerationStage, DocumentValidationStage, FieldDiscoveryStage};
pub use generation::{GenerationRequest, GenerationTarget, QueryGenerator};
pub use history::QueryHistoryStage;
pub use relational::{SchemaDiscoveryStage, SqlExecutionStage, SqlGenerationStage, SqlSafetyStage};

use crate::context::{QueryContext, RunState};
use crate::document::DocumentQueryValidator;
use crate::error::{AppError, AppResult};
use crate::store::DatasetRegistry;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A stage stopped the run
#[derive(Debug)]
pub struct Halt {
    pub context: QueryContext,
    pub error: AppError,
}

pub type StageResult = Result<QueryContext, Halt>;

/// One step of a pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable snake_case name, recorded on failure
    fn name(&self) -> &'static str;

    /// Advance the context in place
    async fn apply(&self, ctx: &mut QueryContext) -> AppResult<()>;

    async fn run(&self, mut ctx: QueryContext) -> StageResult {
        match self.apply(&mut ctx).await {
            Ok(()) => Ok(ctx),
            Err(error) => Err(Halt {
                context: ctx,
                error,
            }),
        }
    }
}

/// Pipeline topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Relational,
    Dataset,
    Document,
}

/// Builds the stage list for a kind and drives a context through it
#[derive(Clone)]
pub struct PipelineController {
    generator: Arc<dyn QueryGenerator>,
    registry: Option<Arc<dyn DatasetRegistry>>,
    validator: Option<DocumentQueryValidator>,
    post_stages: Vec<Arc<dyn Stage>>,
}

impl PipelineController {
    pub fn new(generator: Arc<dyn QueryGenerator>) -> Self {
        Self {
            generator,
            registry: None,
            validator: None,
            post_stages: Vec::new(),
        }
    }

    pub fn with_dataset_registry(mut self, registry: Arc<dyn DatasetRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Fixed validator for every document run, in place of one built from
    /// each request's [`QueryLimits`](crate::config::QueryLimits)
    pub fn with_document_validator(mut self, validator: DocumentQueryValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Append a stage that runs after execution for every kind
    pub fn with_post_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.post_stages.push(stage);
        self
    }

    pub fn stages(&self, kind: PipelineKind) -> Vec<Arc<dyn Stage>> {
        let mut stages: Vec<Arc<dyn Stage>> = match kind {
            PipelineKind::Relational => vec![
                Arc::new(SchemaDiscoveryStage),
                Arc::new(SqlGenerationStage::new(self.generator.clone())),
                Arc::new(SqlSafetyStage),
                Arc::new(SqlExecutionStage),
            ],
            PipelineKind::Dataset => vec![
                Arc::new(DatasetSchemaStage::new(self.registry.clone())),
                Arc::new(SqlGenerationStage::new(self.generator.clone()).with_placeholder()),
                Arc::new(PlaceholderResolutionStage::new(self.registry.clone())),
                Arc::new(SqlSafetyStage),
                Arc::new(SqlExecutionStage),
            ],
            PipelineKind::Document => vec![
                Arc::new(FieldDiscoveryStage),
                Arc::new(DocumentGenerationStage::new(self.generator.clone())),
                Arc::new(match &self.validator {
                    Some(validator) => DocumentValidationStage::new(validator.clone()),
                    None => DocumentValidationStage::default(),
                }),
                Arc::new(DocumentExecutionStage),
            ],
        };
        stages.extend(self.post_stages.iter().cloned());
        stages
    }

    pub async fn run(&self, kind: PipelineKind, ctx: QueryContext) -> QueryContext {
        info!(request_id = %ctx.request_id, kind = ?kind, "Starting query pipeline");
        run_stages(&self.stages(kind), ctx).await
    }
}

/// Drive `ctx` through `stages`, stopping at the first halt
pub async fn run_stages(stages: &[Arc<dyn Stage>], mut ctx: QueryContext) -> QueryContext {
    ctx.started_at = Some(Utc::now());

    for (index, stage) in stages.iter().enumerate() {
        debug!(request_id = %ctx.request_id, stage = stage.name(), "Running stage");
        match stage.run(ctx).await {
            Ok(next) => {
                ctx = next;
                ctx.state = RunState::StageComplete {
                    index,
                    stage: stage.name().to_string(),
                };
            }
            Err(Halt { mut context, error }) => {
                warn!(
                    request_id = %context.request_id,
                    stage = stage.name(),
                    code = error.code(),
                    "Pipeline halted: {}",
                    error
                );
                context.fail(stage.name(), &error);
                context.finished_at = Some(Utc::now());
                return context;
            }
        }
    }

    ctx.state = RunState::Succeeded;
    ctx.finished_at = Some(Utc::now());
    info!(
        request_id = %ctx.request_id,
        rows = ctx.results.len(),
        "Query pipeline succeeded"
    );
    ctx
}
