//! Dataset registry and query history backed by the application database

use super::{DatasetEntry, DatasetRegistry, HistoryEntry, QueryHistory};
use crate::error::AppResult;
use crate::schema::ColumnInfo;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::debug;

/// Reads `dataset_registry` and `dataset_columns`
#[derive(Clone)]
pub struct PostgresDatasetRegistry {
    pool: Pool,
}

impl PostgresDatasetRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatasetRegistry for PostgresDatasetRegistry {
    async fn lookup(&self, user_id: &str, dataset_id: &str) -> AppResult<Option<DatasetEntry>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                r#"
                SELECT table_schema_name, table_name
                FROM dataset_registry
                WHERE dataset_id = $1 AND user_id::text = $2
                "#,
                &[&dataset_id, &user_id],
            )
            .await?;

        let Some(row) = row else {
            debug!(dataset_id, "Dataset not registered for user");
            return Ok(None);
        };

        let columns = client
            .query(
                r#"
                SELECT column_name, pg_type
                FROM dataset_columns
                WHERE dataset_id = $1
                ORDER BY ordinal_position
                "#,
                &[&dataset_id],
            )
            .await?
            .iter()
            .map(|r| ColumnInfo::new(r.get::<_, String>("column_name"), r.get::<_, String>("pg_type")))
            .collect();

        Ok(Some(DatasetEntry {
            dataset_id: dataset_id.to_string(),
            schema_name: row.get("table_schema_name"),
            table_name: row.get("table_name"),
            columns,
        }))
    }
}

/// Appends to `query_history`
#[derive(Clone)]
pub struct PostgresQueryHistory {
    pool: Pool,
}

impl PostgresQueryHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryHistory for PostgresQueryHistory {
    async fn record(&self, entry: &HistoryEntry) -> AppResult<()> {
        let client = self.pool.get().await?;
        let row_count = entry.row_count as i32;
        let execution_time_ms = entry.execution_time_ms.map(|ms| ms as i32);

        client
            .execute(
                r#"
                INSERT INTO query_history
                    (user_id, workspace_id, question, sql, selected_datasets, row_count, execution_time_ms)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
                &[
                    &entry.user_id,
                    &entry.workspace_id,
                    &entry.question,
                    &entry.query_text,
                    &entry.selected_datasets,
                    &row_count,
                    &execution_time_ms,
                ],
            )
            .await?;

        Ok(())
    }
}
