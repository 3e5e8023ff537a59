//! Field allow-list and field-reference extraction
//!
//! The allow-list is inferred from sampled documents. Extraction walks a
//! [`QuerySpec`] through its [`SpecNode`] view and knows which positions name
//! fields:
//!
//! * filter context (`find.filter`, `$match`, sort and find projection keys):
//!   plain object keys are field paths
//! * expression context (`$group`, `$project` values, `$addFields`, `$expr`):
//!   only `"$path"` strings are references, and output keys become computed
//!   fields later stages may use

use super::error::DocumentQueryError;
use super::node::{Key, SpecNode};
use super::spec::QuerySpec;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const IDENTITY_FIELD: &str = "_id";

/// Fields listed in an `UnknownField` rejection
const REPORTED_FIELDS: usize = 50;

/// Nesting depth followed while profiling samples
const MAX_PROFILE_DEPTH: usize = 6;

/// Array elements inspected per array while profiling
const ARRAY_SAMPLE: usize = 5;

/// `items[].price` -> `items.price`, leading dots removed
pub fn normalize_field_path(path: &str) -> String {
    path.replace("[]", "").trim_start_matches('.').to_string()
}

/// Field paths a document query may reference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldAllowList {
    paths: BTreeSet<String>,
}

impl FieldAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allow = Self::new();
        for path in paths {
            allow.insert(path.as_ref());
        }
        allow
    }

    pub fn insert(&mut self, path: &str) {
        let path = normalize_field_path(path);
        if !path.is_empty() {
            self.paths.insert(path);
        }
    }

    /// No fields besides the identity field
    pub fn is_trivial(&self) -> bool {
        self.paths.iter().all(|p| p == IDENTITY_FIELD)
    }

    pub fn permits(&self, path: &str) -> bool {
        let path = normalize_field_path(path);
        is_identity_path(&path) || self.paths.contains(&path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn reported(&self) -> Vec<String> {
        std::iter::once(IDENTITY_FIELD.to_string())
            .chain(self.paths.iter().filter(|p| *p != IDENTITY_FIELD).cloned())
            .take(REPORTED_FIELDS)
            .collect()
    }
}

fn is_identity_path(path: &str) -> bool {
    path == IDENTITY_FIELD || path.starts_with("_id.")
}

fn root_segment(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Reject the first field reference outside `allowed`.
///
/// A trivial allow-list (nothing but `_id`) accepts every spec.
pub fn validate_fields(spec: &QuerySpec, allowed: &FieldAllowList) -> Result<(), DocumentQueryError> {
    if allowed.is_trivial() {
        return Ok(());
    }

    for path in extract_field_refs(spec) {
        if !allowed.permits(&path) {
            return Err(DocumentQueryError::UnknownField {
                path,
                allowed: allowed.reported(),
            });
        }
    }
    Ok(())
}

/// Input field paths referenced by `spec`, normalized.
///
/// Identity paths and fields computed by earlier aggregation stages are left out.
pub fn extract_field_refs(spec: &QuerySpec) -> BTreeSet<String> {
    let mut walker = RefWalker::default();

    match spec {
        QuerySpec::Find {
            filter,
            projection,
            sort,
            ..
        } => {
            walker.filter(&SpecNode::from_value(&Value::Object(filter.clone())), None);
            if let Some(projection) = projection {
                walker.projection(&SpecNode::from_value(&Value::Object(projection.clone())), false);
            }
            if let Some(sort) = sort {
                walker.sort(&SpecNode::from_value(&Value::Object(sort.clone())));
            }
        }
        QuerySpec::Aggregate { pipeline, .. } => {
            for stage in pipeline {
                walker.stage(&SpecNode::from_value(stage));
            }
        }
    }

    walker.refs
}

#[derive(Default)]
struct RefWalker {
    refs: BTreeSet<String>,
    computed: BTreeSet<String>,
}

impl RefWalker {
    fn record(&mut self, path: &str) {
        let path = normalize_field_path(path);
        if path.is_empty() || is_identity_path(&path) || self.computed.contains(root_segment(&path)) {
            return;
        }
        self.refs.insert(path);
    }

    fn stage(&mut self, node: &SpecNode) {
        let SpecNode::Object(entries) = node else {
            self.expression(node);
            return;
        };

        for (key, body) in entries {
            match key {
                Key::Operator(op) => match op.as_str() {
                    "$match" => self.filter(body, None),
                    "$sort" => self.sort(body),
                    "$project" => self.projection(body, true),
                    "$group" => self.group(body),
                    "$addFields" | "$set" => self.computed_fields(body),
                    _ => self.expression(body),
                },
                _ => self.expression(body),
            }
        }
    }

    /// Filter context. `prefix` is set inside `$elemMatch`.
    fn filter(&mut self, node: &SpecNode, prefix: Option<&str>) {
        match node {
            SpecNode::Object(entries) => {
                for (key, value) in entries {
                    match key {
                        Key::Name(name) => {
                            let path = match prefix {
                                Some(prefix) => format!("{}.{}", prefix, name),
                                None => name.clone(),
                            };
                            self.record(&path);
                            self.field_condition(value, &path);
                        }
                        Key::Identity => self.field_condition(value, IDENTITY_FIELD),
                        Key::Operator(op) if op == "$expr" => self.expression(value),
                        Key::Operator(_) => self.filter(value, prefix),
                    }
                }
            }
            SpecNode::Array(items) => items.iter().for_each(|item| self.filter(item, prefix)),
            other => self.expression(other),
        }
    }

    /// The value compared against `path` in a filter
    fn field_condition(&mut self, node: &SpecNode, path: &str) {
        match node {
            SpecNode::Object(entries) => {
                for (key, value) in entries {
                    match key {
                        Key::Operator(op) if op == "$elemMatch" => self.filter(value, Some(path)),
                        Key::Operator(_) => self.field_condition(value, path),
                        Key::Name(name) => {
                            let nested = format!("{}.{}", path, name);
                            self.record(&nested);
                            self.field_condition(value, &nested);
                        }
                        Key::Identity => self.field_condition(value, path),
                    }
                }
            }
            SpecNode::Array(items) => items.iter().for_each(|item| self.field_condition(item, path)),
            other => self.expression(other),
        }
    }

    /// Expression context: only `$` references count
    fn expression(&mut self, node: &SpecNode) {
        match node {
            SpecNode::FieldRef(path) => self.record(path),
            SpecNode::Object(entries) => entries.iter().for_each(|(_, value)| self.expression(value)),
            SpecNode::Array(items) => items.iter().for_each(|item| self.expression(item)),
            SpecNode::Scalar(_) | SpecNode::SystemVar(_) => {}
        }
    }

    fn sort(&mut self, node: &SpecNode) {
        if let SpecNode::Object(entries) = node {
            for (key, _) in entries {
                if let Key::Name(name) = key {
                    self.record(name);
                }
            }
        }
    }

    /// Inclusion flags name input fields; expressions define computed outputs
    fn projection(&mut self, node: &SpecNode, computes: bool) {
        let SpecNode::Object(entries) = node else {
            return;
        };

        let mut outputs = Vec::new();
        for (key, value) in entries {
            let Key::Name(name) = key else {
                self.expression(value);
                continue;
            };
            if value.is_scalar() {
                self.record(name);
            } else {
                self.expression(value);
                outputs.push(name.clone());
            }
        }

        if computes {
            self.computed.extend(outputs);
        }
    }

    fn group(&mut self, node: &SpecNode) {
        let SpecNode::Object(entries) = node else {
            return;
        };

        let mut outputs = Vec::new();
        for (key, value) in entries {
            self.expression(value);
            if let Key::Name(name) = key {
                outputs.push(name.clone());
            }
        }
        self.computed.extend(outputs);
    }

    fn computed_fields(&mut self, node: &SpecNode) {
        let SpecNode::Object(entries) = node else {
            return;
        };

        let mut outputs = Vec::new();
        for (key, value) in entries {
            self.expression(value);
            if let Key::Name(name) = key {
                outputs.push(root_segment(name).to_string());
            }
        }
        self.computed.extend(outputs);
    }
}

/// Sampled statistics for one field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldProfile {
    /// Path with `[]` array markers
    pub path: String,
    /// Documents containing the path
    pub presence: usize,
    /// Type name -> occurrences
    pub types: BTreeMap<String, usize>,
}

impl FieldProfile {
    pub fn dominant_type(&self) -> Option<&str> {
        self.types
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(name, _)| name.as_str())
    }

    pub fn is_date_like(&self) -> bool {
        self.date_encoding().is_some()
    }

    /// Encoding of a date-like path; native dates win a tie with text dates
    pub fn date_encoding(&self) -> Option<DateEncoding> {
        if !matches!(self.dominant_type(), Some("datetime") | Some("date")) {
            return None;
        }
        let count = |name: &str| self.types.get(name).copied().unwrap_or(0);
        if count("datetime") >= count("date") {
            Some(DateEncoding::Native)
        } else {
            Some(DateEncoding::Text)
        }
    }
}

/// How sampled documents store a date field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateEncoding {
    /// BSON date, `{"$date": ...}` in extended JSON
    Native,
    /// RFC 3339 or `YYYY-MM-DD` string
    Text,
}

/// Date field picked for the lookback window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateField {
    pub path: String,
    pub encoding: DateEncoding,
}

impl DateField {
    pub fn native(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            encoding: DateEncoding::Native,
        }
    }

    pub fn text(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            encoding: DateEncoding::Text,
        }
    }
}

/// Profile sampled documents (extended JSON) into per-path statistics, sorted by path
pub fn profile_documents(documents: &[Value]) -> Vec<FieldProfile> {
    let mut profiles: BTreeMap<String, FieldProfile> = BTreeMap::new();

    for doc in documents {
        let Value::Object(map) = doc else {
            continue;
        };

        let mut observed = Vec::new();
        for (key, value) in map {
            if key == IDENTITY_FIELD {
                continue;
            }
            flatten(value, key.clone(), MAX_PROFILE_DEPTH, &mut observed);
        }

        let mut seen = BTreeSet::new();
        for (path, kind) in observed {
            let profile = profiles.entry(path.clone()).or_insert_with(|| FieldProfile {
                path: path.clone(),
                presence: 0,
                types: BTreeMap::new(),
            });
            if seen.insert(path) {
                profile.presence += 1;
            }
            *profile.types.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    profiles.into_values().collect()
}

/// First path whose sampled values are mostly dates
pub fn detect_date_field(profiles: &[FieldProfile]) -> Option<DateField> {
    profiles.iter().find_map(|p| {
        p.date_encoding().map(|encoding| DateField {
            path: normalize_field_path(&p.path),
            encoding,
        })
    })
}

impl FieldAllowList {
    /// Allow-list from profiled paths, container paths included
    pub fn from_profiles(profiles: &[FieldProfile]) -> Self {
        Self::from_paths(profiles.iter().map(|p| p.path.as_str()))
    }
}

fn flatten(value: &Value, path: String, depth: usize, out: &mut Vec<(String, &'static str)>) {
    if depth == 0 {
        return;
    }

    let kind = type_name(value);
    out.push((path.clone(), kind));

    match value {
        Value::Object(map) if kind == "object" => {
            for (key, child) in map {
                flatten(child, format!("{}.{}", path, key), depth - 1, out);
            }
        }
        Value::Array(items) => {
            let element_path = format!("{}[]", path);
            for item in items.iter().take(ARRAY_SAMPLE) {
                match item {
                    Value::Object(map) if type_name(item) == "object" => {
                        for (key, child) in map {
                            flatten(child, format!("{}.{}", element_path, key), depth - 1, out);
                        }
                    }
                    _ => out.push((element_path.clone(), type_name(item))),
                }
            }
        }
        _ => {}
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(s) if looks_like_date(s) => "date",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(map) if map.len() == 1 && map.contains_key("$date") => "datetime",
        Value::Object(map) if map.len() == 1 && map.contains_key("$oid") => "objectid",
        Value::Object(_) => "object",
    }
}

fn looks_like_date(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec(value: Value) -> QuerySpec {
        QuerySpec::from_value(&value, 50).unwrap()
    }

    #[test]
    fn test_normalize_field_path() {
        assert_eq!(normalize_field_path("items[].price"), "items.price");
        assert_eq!(normalize_field_path(".region"), "region");
    }

    #[test]
    fn test_unknown_filter_field_is_rejected() {
        let allowed = FieldAllowList::from_paths(["region", "total"]);
        let err = validate_fields(&spec(json!({"query_type": "find", "filter": {"status": "open"}})), &allowed)
            .unwrap_err();
        match err {
            DocumentQueryError::UnknownField { path, .. } => assert_eq!(path, "status"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_trivial_allow_list_skips_validation() {
        let allowed = FieldAllowList::from_paths(["_id"]);
        let query = spec(json!({
            "query_type": "aggregate",
            "pipeline": [{"$match": {"anything": 1}}, {"$group": {"_id": "$whatever"}}]
        }));
        assert!(validate_fields(&query, &allowed).is_ok());
        assert!(validate_fields(&query, &FieldAllowList::new()).is_ok());
    }

    #[test]
    fn test_operators_and_system_vars_are_not_fields() {
        let query = spec(json!({
            "query_type": "find",
            "filter": {"$or": [{"region": {"$in": ["west", "east"]}}, {"total": {"$gte": 10}}]},
            "projection": {"region": 1, "_id": 0}
        }));
        let refs: Vec<String> = extract_field_refs(&query).into_iter().collect();
        assert_eq!(refs, vec!["region", "total"]);
    }

    #[test]
    fn test_computed_fields_are_usable_downstream() {
        let query = spec(json!({
            "query_type": "aggregate",
            "pipeline": [
                {"$unwind": "$items"},
                {"$group": {"_id": "$region", "revenue": {"$sum": "$items.price"}}},
                {"$addFields": {"share": {"$divide": ["$revenue", 100]}}},
                {"$sort": {"revenue": -1, "share": 1}},
                {"$project": {"label": {"$concat": ["$_id", "!"]}}},
                {"$match": {"label": {"$ne": null}}}
            ]
        }));
        let refs: Vec<String> = extract_field_refs(&query).into_iter().collect();
        assert_eq!(refs, vec!["items", "items.price", "region"]);
    }

    #[test]
    fn test_expr_switches_to_expression_context() {
        let query = spec(json!({
            "query_type": "find",
            "filter": {"$expr": {"$gt": ["$total", "$discount"]}}
        }));
        let refs: Vec<String> = extract_field_refs(&query).into_iter().collect();
        assert_eq!(refs, vec!["discount", "total"]);
    }

    #[test]
    fn test_elem_match_keys_are_sub_paths() {
        let allowed = FieldAllowList::from_paths(["items", "items[].price"]);
        let ok = spec(json!({
            "query_type": "find",
            "filter": {"items": {"$elemMatch": {"price": {"$gt": 5}}}}
        }));
        assert!(validate_fields(&ok, &allowed).is_ok());

        let bad = spec(json!({
            "query_type": "find",
            "filter": {"items": {"$elemMatch": {"sku": "x"}}}
        }));
        assert!(validate_fields(&bad, &allowed).is_err());
    }

    #[test]
    fn test_identity_paths_always_allowed() {
        let allowed = FieldAllowList::from_paths(["region"]);
        let query = spec(json!({"query_type": "find", "filter": {"_id": {"$in": [1, 2]}}}));
        assert!(validate_fields(&query, &allowed).is_ok());
        assert!(allowed.permits("_id.region"));
    }

    #[test]
    fn test_profile_documents() {
        let docs = vec![
            json!({"_id": {"$oid": "1"}, "region": "west", "created_at": {"$date": "2024-01-02T00:00:00Z"},
                   "items": [{"price": 3.5}, {"price": 4}]}),
            json!({"region": "east", "created_at": "2024-02-01", "items": []}),
        ];
        let profiles = profile_documents(&docs);
        let paths: Vec<&str> = profiles.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["created_at", "items", "items[].price", "region"]);

        let items = &profiles[1];
        assert_eq!(items.presence, 2);
        assert_eq!(detect_date_field(&profiles), Some(DateField::native("created_at")));

        let allowed = FieldAllowList::from_profiles(&profiles);
        assert!(allowed.permits("items.price"));
        assert!(!allowed.is_trivial());
    }

    #[test]
    fn test_date_field_encoding_follows_samples() {
        let text_dates = vec![
            json!({"day": "2024-02-01", "region": "west"}),
            json!({"day": "2024-02-03T10:00:00Z", "region": "east"}),
        ];
        let profiles = profile_documents(&text_dates);
        assert_eq!(detect_date_field(&profiles), Some(DateField::text("day")));

        let mostly_native = vec![
            json!({"ts": {"$date": "2024-01-02T00:00:00Z"}}),
            json!({"ts": {"$date": "2024-01-03T00:00:00Z"}}),
            json!({"ts": "2024-01-04"}),
        ];
        let profiles = profile_documents(&mostly_native);
        assert_eq!(profiles[0].date_encoding(), Some(DateEncoding::Native));

        let no_dates = vec![json!({"region": "west", "total": 3})];
        assert_eq!(detect_date_field(&profile_documents(&no_dates)), None);
    }
}
