//! QueryGate - safety layer for generated database queries
//!
//! Turns a natural-language question into a query through an external
//! generator, then refuses to run anything that is not a single read-only
//! query confined to the tables, columns and fields discovered for the
//! caller. Three pipeline kinds share one stage chain model:
//!
//! - **Relational**: live PostgreSQL schema, generated SQL, [`guard::SqlGuard`]
//! - **Dataset**: uploaded datasets from the registry, `{table}` placeholder resolution
//! - **Document**: sampled field allow-list, generated find/aggregate spec,
//!   [`document::DocumentQueryValidator`]
//!
//! ```ignore
//! let settings = Settings::load()?;
//! let store = Arc::new(PostgresStore::connect(&tenant_url, &settings)?);
//! let controller = PipelineController::new(generator);
//! let ctx = QueryContext::new("revenue by region", Some(100), settings.limits.clone())
//!     .with_relational_store(store);
//! let outcome = controller.run(PipelineKind::Relational, ctx).await.outcome();
//! ```

pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod guard;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod telemetry;

pub use config::{QueryLimits, Settings};
pub use context::{QueryContext, QueryOutcome, RunState};
pub use error::{AppError, AppResult, ErrorResponse};
pub use guard::{RelationalAllowList, SqlGuard, SqlGuardError};
pub use pipeline::{PipelineController, PipelineKind, QueryGenerator, Stage};
