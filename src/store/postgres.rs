//! PostgreSQL relational store
//!
//! Pool creation (optionally over TLS), schema discovery through
//! `information_schema`, and read-only row fetching.

use super::{RelationalStore, RowSet};
use crate::config::{DatabaseConfig, Settings};
use crate::error::{AppError, AppResult};
use crate::guard::{qualified_table_name, quote_ident};
use crate::schema::{
    canonical_table_name, compute_join_hints, is_categorical_column, is_internal_table,
    CategoricalHints, ColumnInfo, DiscoveredSchema, SchemaMap,
};
use async_trait::async_trait;
use deadpool_postgres::{Client, Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde_json::Value;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

/// Slack on top of the server-side statement timeout, covering pool checkout
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// Build a connection pool; TLS roots come from the platform store
pub fn create_pool(config: &DatabaseConfig) -> AppResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size.max(1)));

    let pool = if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        for err in &certs.errors {
            warn!("Skipping unreadable native certificate: {}", err);
        }
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| AppError::Config(format!("Failed to create TLS pool: {}", e)))?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))?
    };

    debug!(
        host = %config.host,
        database = %config.database,
        tls = config.require_tls,
        "Created PostgreSQL pool"
    );
    Ok(pool)
}

/// Run a trivial query to prove the pool can connect
pub async fn verify_connection(pool: &Pool) -> AppResult<()> {
    let client = pool.get().await?;
    client.query_one("SELECT 1 AS ok", &[]).await?;
    Ok(())
}

/// A tenant database reached through a pool
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
    categorical_sample_limit: usize,
}

impl PostgresStore {
    pub fn new(pool: Pool, categorical_sample_limit: usize) -> Self {
        Self {
            pool,
            categorical_sample_limit,
        }
    }

    /// Pool a tenant connection string (`postgresql://...`)
    pub fn connect(connection_url: &str, settings: &Settings) -> AppResult<Self> {
        let config = Settings::parse_database_url(connection_url)
            .map_err(|e| AppError::Config(e.to_string()))?;
        let pool = create_pool(&config)?;
        Ok(Self::new(pool, settings.limits.categorical_sample_limit))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn list_tables(client: &Client) -> AppResult<Vec<(String, String)>> {
        let query = r#"
            SELECT t.table_schema, t.table_name
            FROM information_schema.tables t
            WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')
              AND t.table_schema NOT LIKE 'pg_toast%'
              AND t.table_type = 'BASE TABLE'
            ORDER BY t.table_schema, t.table_name
        "#;

        let rows = client.query(query, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<_, String>("table_schema"),
                    row.get::<_, String>("table_name"),
                )
            })
            .filter(|(_, table)| !is_internal_table(table))
            .collect())
    }

    async fn list_columns(client: &Client, schema: &str, table: &str) -> AppResult<Vec<ColumnInfo>> {
        let query = r#"
            SELECT c.column_name, c.data_type
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;

        let rows = client.query(query, &[&schema, &table]).await?;
        Ok(rows
            .iter()
            .map(|row| ColumnInfo::new(row.get::<_, String>("column_name"), row.get::<_, String>("data_type")))
            .collect())
    }

    async fn distinct_values(
        &self,
        client: &Client,
        schema: &str,
        table: &str,
        column: &str,
    ) -> AppResult<Vec<String>> {
        let query = distinct_values_query(schema, table, column);
        let limit = self.categorical_sample_limit as i64;
        let rows = client.query(query.as_str(), &[&limit]).await?;
        Ok(rows.iter().filter_map(|row| row.get::<_, Option<String>>(0)).collect())
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn discover_schema(&self) -> AppResult<DiscoveredSchema> {
        let client = self.pool.get().await?;

        let mut tables = SchemaMap::new();
        let mut raw_names = Vec::new();
        for (schema, table) in Self::list_tables(&client).await? {
            let columns = Self::list_columns(&client, &schema, &table).await?;
            if columns.is_empty() {
                continue;
            }
            raw_names.push((schema.clone(), table.clone()));
            tables.insert(canonical_table_name(&schema, &table), columns);
        }

        let mut categorical_values = CategoricalHints::new();
        for (schema, table) in &raw_names {
            let canonical = canonical_table_name(schema, table);
            let Some(columns) = tables.get(&canonical) else {
                continue;
            };
            for column in columns.iter().filter(|c| is_categorical_column(&c.name)) {
                // A failing sample only loses a hint
                match self.distinct_values(&client, schema, table, &column.name).await {
                    Ok(values) if !values.is_empty() => {
                        categorical_values
                            .insert(format!("{}.{}", canonical, column.name.to_lowercase()), values);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping categorical values for {}.{}: {}", canonical, column.name, e),
                }
            }
        }

        let join_hints = compute_join_hints(&tables);

        info!(
            tables = tables.len(),
            categorical = categorical_values.len(),
            join_hints = join_hints.len(),
            "Discovered relational schema"
        );

        Ok(DiscoveredSchema {
            tables,
            categorical_values,
            join_hints,
        })
    }

    async fn fetch_rows(&self, sql: &str, timeout: Duration) -> AppResult<RowSet> {
        let timeout_ms = timeout.as_millis();
        let run = async {
            let mut client = self.pool.get().await?;
            let tx = client.build_transaction().read_only(true).start().await?;
            tx.batch_execute(&format!("SET LOCAL statement_timeout = {}", timeout_ms))
                .await?;

            let body = unterminated(sql);
            let statement = tx.prepare(body).await?;
            let columns: Vec<String> = statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();

            let rows = tx.query(row_json_query(body).as_str(), &[]).await?;
            tx.rollback().await?;

            let rows = rows
                .iter()
                .filter_map(|row| match row.get::<_, Value>(0) {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect();

            Ok::<_, AppError>(RowSet { columns, rows })
        };

        match tokio::time::timeout(timeout + CLIENT_TIMEOUT_SLACK, run).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(AppError::Database(e))) if e.code() == Some(&SqlState::QUERY_CANCELED) => Err(
                AppError::Timeout(format!("statement exceeded {} ms", timeout_ms)),
            ),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AppError::Timeout(format!(
                "no result within {} ms",
                (timeout + CLIENT_TIMEOUT_SLACK).as_millis()
            ))),
        }
    }
}

/// Statement without trailing terminators, ready to nest as a sub-select
fn unterminated(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Wrap a SELECT so every row comes back as one ordered JSON object
fn row_json_query(body: &str) -> String {
    format!("SELECT row_to_json(q) FROM ({}) q", body)
}

fn distinct_values_query(schema: &str, table: &str, column: &str) -> String {
    let column = quote_ident(column);
    format!(
        "SELECT DISTINCT {col}::text FROM {table} WHERE {col} IS NOT NULL ORDER BY 1 LIMIT $1",
        col = column,
        table = qualified_table_name(schema, table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unterminated_strips_semicolons() {
        assert_eq!(unterminated("  SELECT 1 ; ;\n"), "SELECT 1");
        assert_eq!(unterminated("SELECT 'a;b'"), "SELECT 'a;b'");
    }

    #[test]
    fn test_row_json_query_wraps_statement() {
        assert_eq!(
            row_json_query("SELECT o.id FROM sales.orders o LIMIT 5"),
            "SELECT row_to_json(q) FROM (SELECT o.id FROM sales.orders o LIMIT 5) q"
        );
    }

    #[test]
    fn test_distinct_values_query_quotes_identifiers() {
        assert_eq!(
            distinct_values_query("sales", "orders", "status"),
            "SELECT DISTINCT \"status\"::text FROM \"sales\".\"orders\" WHERE \"status\" IS NOT NULL ORDER BY 1 LIMIT $1"
        );
    }
}
