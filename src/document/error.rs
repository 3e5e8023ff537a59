//! Rejections raised by the document query validator

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentQueryError {
    #[error("query_type must be 'find' or 'aggregate' (got {0})")]
    InvalidQueryType(String),

    #[error("Operator '{name}' is not permitted (at {path})")]
    BlockedOperator { name: String, path: String },

    #[error("Pipeline too long: {len} stages (max {max})")]
    PipelineTooLong { len: usize, max: usize },

    #[error("Invalid pipeline shape: {0}")]
    InvalidStageShape(String),

    #[error("Stage not allowed: {0}")]
    DisallowedStage(String),

    #[error("Query references non-existent field: '{path}'. Allowed fields (sample): [{}]", .allowed.join(", "))]
    UnknownField { path: String, allowed: Vec<String> },
}

impl DocumentQueryError {
    pub fn is_confinement(&self) -> bool {
        matches!(self, DocumentQueryError::UnknownField { .. })
    }
}
