//! Document query specification
//!
//! Parsed form of the generator's JSON output. Stages stay as raw JSON until
//! [`DocumentQueryValidator::validate`](super::DocumentQueryValidator::validate)
//! checks their shape.

use super::error::DocumentQueryError;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum QuerySpec {
    Find {
        filter: Map<String, Value>,
        projection: Option<Map<String, Value>>,
        sort: Option<Map<String, Value>>,
        limit: i64,
    },
    Aggregate {
        pipeline: Vec<Value>,
        limit: i64,
    },
}

impl QuerySpec {
    /// Parse generator output; a missing or non-integer `limit` becomes `requested_limit`
    pub fn from_value(value: &Value, requested_limit: i64) -> Result<Self, DocumentQueryError> {
        let obj = value.as_object().ok_or_else(|| {
            DocumentQueryError::InvalidQueryType("a non-object specification".to_string())
        })?;

        let query_type = obj
            .get("query_type")
            .and_then(Value::as_str)
            .map(|t| t.trim().to_lowercase())
            .unwrap_or_default();

        let limit = obj
            .get("limit")
            .and_then(Value::as_i64)
            .unwrap_or(requested_limit);

        match query_type.as_str() {
            "find" => Ok(QuerySpec::Find {
                filter: optional_object(obj, "filter")?.unwrap_or_default(),
                projection: optional_object(obj, "projection")?,
                sort: optional_object(obj, "sort")?,
                limit,
            }),
            "aggregate" => match obj.get("pipeline") {
                Some(Value::Array(stages)) => Ok(QuerySpec::Aggregate {
                    pipeline: stages.clone(),
                    limit,
                }),
                _ => Err(DocumentQueryError::InvalidStageShape(
                    "aggregate pipeline must be a list".to_string(),
                )),
            },
            "" => Err(DocumentQueryError::InvalidQueryType("nothing".to_string())),
            other => Err(DocumentQueryError::InvalidQueryType(format!("'{}'", other))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            QuerySpec::Find {
                filter,
                projection,
                sort,
                limit,
            } => {
                let mut out = json!({
                    "query_type": "find",
                    "filter": filter,
                });
                if let Some(projection) = projection {
                    out["projection"] = Value::Object(projection.clone());
                }
                if let Some(sort) = sort {
                    out["sort"] = Value::Object(sort.clone());
                }
                out["limit"] = json!(limit);
                out
            }
            QuerySpec::Aggregate { pipeline, limit } => json!({
                "query_type": "aggregate",
                "pipeline": pipeline,
                "limit": limit,
            }),
        }
    }

    pub fn query_type(&self) -> &'static str {
        match self {
            QuerySpec::Find { .. } => "find",
            QuerySpec::Aggregate { .. } => "aggregate",
        }
    }

    pub fn limit(&self) -> i64 {
        match self {
            QuerySpec::Find { limit, .. } | QuerySpec::Aggregate { limit, .. } => *limit,
        }
    }
}

fn optional_object(
    obj: &Map<String, Value>,
    key: &str,
) -> Result<Option<Map<String, Value>>, DocumentQueryError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(DocumentQueryError::InvalidStageShape(format!(
            "'{}' must be an object",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_find_defaults() {
        let spec = QuerySpec::from_value(&json!({"query_type": " FIND "}), 25).unwrap();
        assert_eq!(
            spec,
            QuerySpec::Find {
                filter: Map::new(),
                projection: None,
                sort: None,
                limit: 25,
            }
        );
    }

    #[test]
    fn test_non_integer_limit_falls_back() {
        let spec = QuerySpec::from_value(
            &json!({"query_type": "aggregate", "pipeline": [], "limit": "ten"}),
            40,
        )
        .unwrap();
        assert_eq!(spec.limit(), 40);
    }

    #[test]
    fn test_rejects_unknown_type_and_bad_pipeline() {
        let err = QuerySpec::from_value(&json!({"query_type": "delete"}), 10).unwrap_err();
        assert!(matches!(err, DocumentQueryError::InvalidQueryType(_)));

        let err = QuerySpec::from_value(&json!({"query_type": "aggregate", "pipeline": {}}), 10)
            .unwrap_err();
        assert!(matches!(err, DocumentQueryError::InvalidStageShape(_)));

        let err = QuerySpec::from_value(&json!([1, 2]), 10).unwrap_err();
        assert!(matches!(err, DocumentQueryError::InvalidQueryType(_)));
    }

    #[test]
    fn test_to_value_keeps_shape() {
        let raw = json!({
            "query_type": "find",
            "filter": {"region": "west"},
            "sort": {"total": -1},
            "limit": 5
        });
        let spec = QuerySpec::from_value(&raw, 50).unwrap();
        assert_eq!(spec.to_value(), raw);
    }
}
