//! Store collaborators
//!
//! Traits for everything that performs I/O on behalf of a pipeline run. Stages only
//! see these traits; PostgreSQL implementations live in [`postgres`] and
//! [`registry`]. Document stores have no implementation here and are supplied by
//! the embedding application.

pub mod postgres;
pub mod registry;

use crate::error::AppResult;
use crate::schema::{ColumnInfo, DiscoveredSchema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub use postgres::{create_pool, PostgresStore};
pub use registry::{PostgresDatasetRegistry, PostgresQueryHistory};

/// One result row, columns in select-list order
pub type Row = Map<String, Value>;

/// Rows returned by a relational fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// A tenant's relational database
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Tables, columns, categorical values and join hints visible to generated queries
    async fn discover_schema(&self) -> AppResult<DiscoveredSchema>;

    /// Run an already-guarded SELECT read-only, bounded by `timeout`
    async fn fetch_rows(&self, sql: &str, timeout: Duration) -> AppResult<RowSet>;
}

/// A tenant's document database, scoped to one database.
///
/// Filters and pipelines arrive in relaxed extended JSON, so a
/// `{"$date": "<rfc3339>"}` value must be read as a BSON date.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Up to `size` raw documents in extended JSON
    async fn sample(&self, collection: &str, size: usize) -> AppResult<Vec<Value>>;

    async fn find(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        projection: Option<&Map<String, Value>>,
        sort: Option<&Map<String, Value>>,
        limit: u32,
    ) -> AppResult<Vec<Row>>;

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> AppResult<Vec<Row>>;
}

/// Registered upload backing a dataset id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetEntry {
    pub dataset_id: String,
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
}

impl DatasetEntry {
    /// Canonical `schema.table`
    pub fn canonical_name(&self) -> String {
        crate::schema::canonical_table_name(&self.schema_name, &self.table_name)
    }
}

/// Lookup of uploaded datasets by id, scoped to their owner
#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    async fn lookup(&self, user_id: &str, dataset_id: &str) -> AppResult<Option<DatasetEntry>>;
}

/// One executed query, as recorded for the user's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub question: String,
    pub query_text: String,
    pub selected_datasets: Vec<String>,
    pub row_count: usize,
    pub execution_time_ms: Option<u64>,
}

#[async_trait]
pub trait QueryHistory: Send + Sync {
    async fn record(&self, entry: &HistoryEntry) -> AppResult<()>;
}
