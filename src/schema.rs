//! Relational schema model
//!
//! Discovery output consumed by the guard and the generator: canonical tables with
//! their ordered columns, categorical value hints and join-key hints.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Application-owned tables never exposed to generated queries
pub const INTERNAL_TABLES: &[&str] = &[
    "users",
    "user_connections",
    "user_api_keys",
    "query_audit_log",
    "user_uploads",
    "dataset_registry",
    "dataset_columns",
    "query_history",
];

/// Column names whose distinct values are worth showing the generator
pub const CATEGORICAL_COLUMNS: &[&str] = &[
    "status",
    "tier",
    "region",
    "category",
    "subcategory",
    "payment_method",
    "method",
    "type",
    "country",
    "brand",
    "db_type",
    "payment_status",
    "order_status",
    "currency",
];

/// Columns listed per join hint
const MAX_JOIN_COLUMNS: usize = 5;

/// Column as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// canonical `schema.table` -> columns in ordinal order
pub type SchemaMap = BTreeMap<String, Vec<ColumnInfo>>;

/// `schema.table.column` -> distinct values
pub type CategoricalHints = BTreeMap<String, Vec<String>>;

/// Two tables sharing column names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinHint {
    pub left: String,
    pub right: String,
    pub shared_columns: Vec<String>,
}

impl std::fmt::Display for JoinHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} and {} share: {}",
            self.left,
            self.right,
            self.shared_columns.join(", ")
        )
    }
}

/// Everything discovery produces for one relational store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSchema {
    pub tables: SchemaMap,
    pub categorical_values: CategoricalHints,
    pub join_hints: Vec<JoinHint>,
}

/// Lower-cased `schema.table` key
pub fn canonical_table_name(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table).to_lowercase()
}

pub fn is_internal_table(table: &str) -> bool {
    INTERNAL_TABLES.contains(&table.to_lowercase().as_str())
}

pub fn is_categorical_column(column: &str) -> bool {
    CATEGORICAL_COLUMNS.contains(&column.to_lowercase().as_str())
}

/// Pairs of tables with shared column names, in table order
pub fn compute_join_hints(tables: &SchemaMap) -> Vec<JoinHint> {
    let column_sets: Vec<(&String, BTreeSet<&str>)> = tables
        .iter()
        .map(|(table, columns)| {
            let names = columns
                .iter()
                .map(|c| c.name.as_str())
                .filter(|n| !n.is_empty())
                .collect();
            (table, names)
        })
        .collect();

    let mut hints = Vec::new();
    for (i, (left, left_cols)) in column_sets.iter().enumerate() {
        for (right, right_cols) in &column_sets[i + 1..] {
            let shared: Vec<String> = left_cols
                .intersection(right_cols)
                .take(MAX_JOIN_COLUMNS)
                .map(|c| c.to_string())
                .collect();
            if !shared.is_empty() {
                hints.push(JoinHint {
                    left: (*left).clone(),
                    right: (*right).clone(),
                    shared_columns: shared,
                });
            }
        }
    }
    hints
}
