//! Rejections raised by the relational guard

use thiserror::Error;

/// Why a generated SQL statement was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlGuardError {
    #[error("Empty SQL statement")]
    EmptyStatement,

    #[error("Unsafe SQL detected: {0}")]
    UnsafeOperation(String),

    #[error("Blocked system schema usage: {0}")]
    SystemSchemaAccess(String),

    #[error("Could not find any FROM/JOIN tables in SQL")]
    NoTableFound,

    #[error("Query references table not in the allowed set: {table}. Allowed: [{}]", .allowed.join(", "))]
    UnknownTable { table: String, allowed: Vec<String> },

    #[error("Unknown table alias used in query: {0}")]
    UnknownAlias(String),

    #[error("Column '{column}' not found in table '{table}'. Allowed: [{}]", .allowed.join(", "))]
    UnknownColumn {
        column: String,
        table: String,
        allowed: Vec<String>,
    },
}

impl SqlGuardError {
    /// True for rejections about *what* is referenced rather than *how*
    pub fn is_confinement(&self) -> bool {
        matches!(
            self,
            SqlGuardError::UnknownTable { .. }
                | SqlGuardError::UnknownAlias(_)
                | SqlGuardError::UnknownColumn { .. }
        )
    }
}
