//! Relational query guard
//!
//! Validates one generated SQL statement against a per-request allow-list of
//! `schema.table -> columns`. The guard rewrites exactly one thing (duplicate
//! `LIMIT` clauses collapse to the last one); every other defect is a rejection.
//!
//! Steps, in order:
//! 1. mask string literals so scans never match data
//! 2. collapse duplicate top-level `LIMIT n` clauses
//! 3. shape check: single read-only `SELECT`, no mutation verbs, no comments,
//!    no system catalogs or system functions
//! 4. extract FROM/JOIN table references and aliases
//! 5. every table must be allow-listed
//! 6. every qualified column must belong to its table
//!
//! Unqualified bare columns are not checked. Table confinement is the binding
//! guarantee; column checks only catch qualified references.

mod error;
pub mod parse;
pub mod placeholder;

pub use error::SqlGuardError;
pub use parse::{extract_column_refs, extract_table_refs, mask_literals, ColumnRef, ParsedStatement};
pub use placeholder::{contains_placeholder, qualified_table_name, quote_ident, substitute_placeholder, TABLE_PLACEHOLDER};

use crate::schema::SchemaMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use tracing::debug;

static LIMIT_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+\d+\b").unwrap());

static MUTATION_VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|merge|drop|alter|truncate|create|grant|revoke|execute|copy|call|into)\b",
    )
    .unwrap()
});

static SYSTEM_SCHEMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(information_schema|pg_catalog|pg_toast)\b").unwrap());

// Functions that reach other databases, the filesystem, session state, or run SQL
// passed as a string (which literal masking would hide).
static SYSTEM_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(pg_[a-z0-9_]*|dblink[a-z0-9_]*|lo_[a-z0-9_]*|loread|lowrite|query_to_xml[a-z0-9_]*|cursor_to_xml[a-z0-9_]*|table_to_xml[a-z0-9_]*|schema_to_xml[a-z0-9_]*|database_to_xml[a-z0-9_]*|ts_stat|set_config|current_setting|nextval|setval)\s*\(",
    )
    .unwrap()
});

static ESCAPE_STRING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:^|[^a-z0-9_$])e'").unwrap());

static DOLLAR_SIGIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^A-Za-z0-9_])\$").unwrap());

/// Canonical `schema.table` -> lower-cased column names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationalAllowList {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl RelationalAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from discovery output
    pub fn from_schema(schema: &SchemaMap) -> Self {
        let mut allow = Self::new();
        for (table, columns) in schema {
            allow.insert(table, columns.iter().map(|c| c.name.as_str()));
        }
        allow
    }

    pub fn insert<I, S>(&mut self, table: &str, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entry = self.tables.entry(table.to_lowercase()).or_default();
        entry.extend(columns.into_iter().map(|c| c.as_ref().to_lowercase()));
    }

    pub fn with_table<I, S>(mut self, table: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert(table, columns);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn columns(&self, table: &str) -> Option<&BTreeSet<String>> {
        self.tables.get(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}

/// A statement that passed the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    /// Statement safe to execute verbatim
    pub sql: String,
    /// Canonical tables the statement reads
    pub tables_used: Vec<String>,
    /// Duplicate `LIMIT` clauses were collapsed
    pub limit_repaired: bool,
}

/// Guard bound to one request's allow-list
#[derive(Debug, Clone)]
pub struct SqlGuard {
    allowed: RelationalAllowList,
}

impl SqlGuard {
    pub fn new(allowed: RelationalAllowList) -> Self {
        Self { allowed }
    }

    pub fn allow_list(&self) -> &RelationalAllowList {
        &self.allowed
    }

    /// Validate and repair, returning only the corrected statement
    pub fn validate_and_fix(&self, sql: &str) -> Result<String, SqlGuardError> {
        self.validate(sql).map(|v| v.sql)
    }

    /// Run every guard step over `sql`.
    ///
    /// An empty allow-list rejects every table; callers that want degraded mode
    /// use [`ensure_safe_select`] instead.
    pub fn validate(&self, sql: &str) -> Result<ValidatedSql, SqlGuardError> {
        let repaired = ensure_safe_select(sql)?;
        let limit_repaired = repaired != sql.trim();

        let masked = mask_literals(&repaired);
        let parsed = extract_table_refs(&masked)?;

        let allowed_tables = || self.allowed.table_names();

        if let Some(func) = parsed.table_functions.iter().next() {
            return Err(SqlGuardError::UnknownTable {
                table: func.clone(),
                allowed: allowed_tables(),
            });
        }

        for table in &parsed.tables_used {
            if !self.allowed.contains_table(table) {
                return Err(SqlGuardError::UnknownTable {
                    table: table.clone(),
                    allowed: allowed_tables(),
                });
            }
        }

        for column_ref in extract_column_refs(&masked, &parsed) {
            self.check_column(&column_ref, &parsed)?;
        }

        Ok(ValidatedSql {
            sql: repaired,
            tables_used: parsed.tables_used.into_iter().collect(),
            limit_repaired,
        })
    }

    fn check_column(&self, column_ref: &ColumnRef, parsed: &ParsedStatement) -> Result<(), SqlGuardError> {
        if column_ref.is_call {
            return Err(SqlGuardError::UnsafeOperation(format!(
                "schema-qualified function call '{}'",
                column_ref.display()
            )));
        }

        let table = match column_ref.qualifier() {
            [alias] => match parsed.alias_to_table.get(alias) {
                Some(table) => table.clone(),
                None if parsed.derived_aliases.contains(alias) => return Ok(()),
                None => return Err(SqlGuardError::UnknownAlias(alias.clone())),
            },
            [schema, table] => {
                let canonical = format!("{}.{}", schema, table);
                if !parsed.tables_used.contains(&canonical) {
                    return Err(SqlGuardError::UnknownTable {
                        table: canonical,
                        allowed: self.allowed.table_names(),
                    });
                }
                canonical
            }
            qualifier => return Err(SqlGuardError::UnknownAlias(qualifier.join("."))),
        };

        if column_ref.is_wildcard() {
            return Ok(());
        }

        let columns = self.allowed.columns(&table).cloned().unwrap_or_default();
        if columns.contains(column_ref.column()) {
            return Ok(());
        }

        Err(SqlGuardError::UnknownColumn {
            column: column_ref.column().to_string(),
            table,
            allowed: columns.into_iter().collect(),
        })
    }
}

/// Guard steps 1-3 only: masking, limit repair and the read-only shape check
pub fn ensure_safe_select(sql: &str) -> Result<String, SqlGuardError> {
    if strip_terminator(sql).is_empty() {
        return Err(SqlGuardError::EmptyStatement);
    }

    let repaired = repair_duplicate_limits(sql);
    check_shape(&mask_literals(&repaired))?;
    Ok(repaired)
}

/// Collapse more than one top-level `LIMIT n` into the last one.
///
/// Fewer than two clauses returns the statement trimmed, so the operation is
/// idempotent.
pub fn repair_duplicate_limits(sql: &str) -> String {
    let trimmed = sql.trim();
    let body = strip_terminator(trimmed);
    let spans = top_level_limits(&mask_literals(body));

    let last = match spans.last() {
        Some(last) if spans.len() > 1 => last.clone(),
        _ => return trimmed.to_string(),
    };

    let mut pieces = Vec::with_capacity(spans.len() + 1);
    let mut cursor = 0;
    for span in &spans {
        pieces.push(body[cursor..span.start].trim());
        cursor = span.end;
    }
    pieces.push(body[cursor..].trim());

    let rest = pieces
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    debug!(clauses = spans.len(), "Collapsed duplicate LIMIT clauses");
    format!("{} {};", rest, &body[last])
}

/// True when the statement has a top-level `LIMIT n` clause.
///
/// Limits inside string literals or parenthesized sub-selects do not count.
pub fn has_limit_clause(sql: &str) -> bool {
    !top_level_limits(&mask_literals(sql)).is_empty()
}

/// Bound the rows a statement can return to `max`.
///
/// The last top-level `LIMIT n` is lowered to `max` when larger; a statement
/// without one gets `LIMIT max` appended.
pub fn enforce_row_limit(sql: &str, max: u32) -> String {
    let masked = mask_literals(sql);
    let Some(span) = top_level_limits(&masked).pop() else {
        return format!("{} LIMIT {}", strip_terminator(sql), max);
    };

    let requested = masked[span.clone()]
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .trim()
        .parse::<u64>()
        .unwrap_or(u64::MAX);
    if requested <= u64::from(max) {
        return sql.to_string();
    }

    debug!(requested, max, "Clamped LIMIT clause");
    format!("{}LIMIT {}{}", &sql[..span.start], max, &sql[span.end..])
}

/// Byte ranges of the `LIMIT n` clauses at paren depth 0 of masked SQL
fn top_level_limits(masked: &str) -> Vec<Range<usize>> {
    let depths = parse::paren_depths(masked);
    LIMIT_CLAUSE
        .find_iter(masked)
        .filter(|m| depths.get(m.start()).copied() == Some(0))
        .map(|m| m.range())
        .collect()
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

fn check_shape(masked: &str) -> Result<(), SqlGuardError> {
    let head = masked.trim_start();
    let starts_with_select = head
        .get(..6)
        .map_or(false, |w| w.eq_ignore_ascii_case("select"))
        && !head[6..].starts_with(|c: char| c.is_alphanumeric() || c == '_');
    if !starts_with_select {
        return Err(SqlGuardError::UnsafeOperation(
            "Only SELECT queries are allowed".to_string(),
        ));
    }

    if masked.contains("--") || masked.contains("/*") {
        return Err(SqlGuardError::UnsafeOperation(
            "SQL comments are not allowed".to_string(),
        ));
    }

    if strip_terminator(masked).contains(';') {
        return Err(SqlGuardError::UnsafeOperation(
            "Multiple statements are not allowed".to_string(),
        ));
    }

    if ESCAPE_STRING.is_match(masked) {
        return Err(SqlGuardError::UnsafeOperation(
            "Escape string literals are not allowed".to_string(),
        ));
    }

    if DOLLAR_SIGIL.is_match(masked) {
        return Err(SqlGuardError::UnsafeOperation(
            "Dollar quoting and positional parameters are not allowed".to_string(),
        ));
    }

    if let Some(m) = MUTATION_VERB.captures(masked).and_then(|c| c.get(1)) {
        return Err(SqlGuardError::UnsafeOperation(format!(
            "Forbidden keyword '{}'",
            m.as_str().to_lowercase()
        )));
    }

    if let Some(m) = SYSTEM_SCHEMA.captures(masked).and_then(|c| c.get(1)) {
        return Err(SqlGuardError::SystemSchemaAccess(m.as_str().to_lowercase()));
    }

    if let Some(m) = SYSTEM_FUNCTION.captures(masked).and_then(|c| c.get(1)) {
        return Err(SqlGuardError::UnsafeOperation(format!(
            "System function '{}' is not allowed",
            m.as_str().to_lowercase()
        )));
    }

    Ok(())
}
