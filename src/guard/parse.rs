//! Pattern-level SQL scanning
//!
//! This is not a grammar. A small tokenizer plus a few clause rules are enough to
//! find the table references and qualified column references of a single SELECT.
//! Everything policy-related lives in the parent module; swapping this file for a
//! real parser only has to preserve [`extract_table_refs`] and [`extract_column_refs`].

use super::error::SqlGuardError;
use super::placeholder::quote_ident;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Functions whose argument list uses `FROM` as a plain keyword
const FROM_TAKING_FUNCTIONS: &[&str] = &["extract", "substring", "trim", "overlay", "position"];

/// Words that end a FROM clause at the current nesting level
const FROM_TERMINATORS: &[&str] = &[
    "where", "group", "order", "having", "limit", "offset", "union", "except", "intersect",
    "window", "fetch", "for", "returning", "select",
];

/// Words that can follow a table reference but are never an alias
const NON_ALIAS_WORDS: &[&str] = &[
    "as", "on", "using", "join", "inner", "left", "right", "full", "outer", "cross", "natural",
    "lateral", "where", "group", "order", "having", "limit", "offset", "union", "except",
    "intersect", "window", "fetch", "for", "and", "or", "not", "select", "from", "tablesample",
    "when", "then", "else", "end", "is", "in", "like", "ilike", "between", "asc", "desc",
    "nulls", "returning", "into", "over", "filter", "only",
];

/// Blank out the contents of single-quoted literals.
///
/// Output has the same byte length as the input, so offsets found in the masked
/// text can be applied to the original. Doubled quotes inside a literal are an
/// escaped quote; single quotes inside double-quoted identifiers are not literals.
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;
    let mut in_ident = false;

    while let Some(c) = chars.next() {
        if in_literal {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push_str("  ");
                } else {
                    in_literal = false;
                    out.push('\'');
                }
            } else {
                out.extend(std::iter::repeat(' ').take(c.len_utf8()));
            }
            continue;
        }

        match c {
            '"' => in_ident = !in_ident,
            '\'' if !in_ident => in_literal = true,
            _ => {}
        }
        out.push(c);
    }

    out
}

/// Paren depth (ignoring quoted identifiers) at every byte offset of masked SQL
pub fn paren_depths(masked: &str) -> Vec<usize> {
    let mut depths = Vec::with_capacity(masked.len());
    let mut depth = 0usize;
    let mut in_ident = false;
    for c in masked.chars() {
        let at = depth;
        match c {
            '"' => in_ident = !in_ident,
            '(' if !in_ident => depth += 1,
            ')' if !in_ident => depth = depth.saturating_sub(1),
            _ => {}
        }
        depths.extend(std::iter::repeat(at).take(c.len_utf8()));
    }
    depths
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    QuotedIdent,
    Literal,
    Number,
    Dot,
    Comma,
    LParen,
    RParen,
    Star,
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    /// Word text as written, or identifier text with quotes removed
    text: String,
    span: Range<usize>,
}

impl Token {
    fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }

    fn lowered(&self) -> String {
        self.text.to_lowercase()
    }

    fn is_alias_candidate(&self) -> bool {
        match self.kind {
            TokenKind::QuotedIdent => true,
            TokenKind::Word => !NON_ALIAS_WORDS.contains(&self.lowered().as_str()),
            _ => false,
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(masked: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut iter = masked.char_indices().peekable();

    while let Some((start, c)) = iter.next() {
        if c.is_whitespace() {
            continue;
        }

        let (kind, text, end) = match c {
            '\'' => {
                let mut end = start + 1;
                for (i, ch) in iter.by_ref() {
                    end = i + ch.len_utf8();
                    if ch == '\'' {
                        break;
                    }
                }
                (TokenKind::Literal, String::new(), end)
            }
            '"' => {
                let mut text = String::new();
                let mut end = masked.len();
                while let Some((i, ch)) = iter.next() {
                    if ch == '"' {
                        if matches!(iter.peek(), Some((_, '"'))) {
                            iter.next();
                            text.push('"');
                            continue;
                        }
                        end = i + 1;
                        break;
                    }
                    text.push(ch);
                }
                (TokenKind::QuotedIdent, text, end)
            }
            c if c.is_ascii_digit() => {
                let mut end = start + 1;
                while let Some(&(i, ch)) = iter.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' {
                        end = i + ch.len_utf8();
                        iter.next();
                    } else {
                        break;
                    }
                }
                (TokenKind::Number, masked[start..end].to_string(), end)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, ch)) = iter.peek() {
                    if is_ident_char(ch) {
                        end = i + ch.len_utf8();
                        iter.next();
                    } else {
                        break;
                    }
                }
                (TokenKind::Word, masked[start..end].to_string(), end)
            }
            '.' => (TokenKind::Dot, ".".to_string(), start + 1),
            ',' => (TokenKind::Comma, ",".to_string(), start + 1),
            '(' => (TokenKind::LParen, "(".to_string(), start + 1),
            ')' => (TokenKind::RParen, ")".to_string(), start + 1),
            '*' => (TokenKind::Star, "*".to_string(), start + 1),
            other => (TokenKind::Other, other.to_string(), start + other.len_utf8()),
        };

        tokens.push(Token {
            kind,
            text,
            span: start..end,
        });
    }

    tokens
}

/// Tables and aliases found in FROM/JOIN clauses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStatement {
    /// alias (lower-cased) -> canonical `schema.table`
    pub alias_to_table: BTreeMap<String, String>,
    /// Every table reference, canonicalized. Unqualified references keep their bare name.
    pub tables_used: BTreeSet<String>,
    /// Aliases of parenthesized sub-selects
    pub derived_aliases: BTreeSet<String>,
    /// Function calls found in table position (`FROM generate_series(...)`)
    pub table_functions: BTreeSet<String>,
    table_spans: Vec<Range<usize>>,
}

impl ParsedStatement {
    fn covers(&self, offset: usize) -> bool {
        self.table_spans.iter().any(|span| span.contains(&offset))
    }
}

/// A dotted reference outside of FROM/JOIN table positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    /// Lower-cased, unquoted parts; the last is the column (or `*`)
    pub parts: Vec<String>,
    /// Followed by `(`, i.e. a qualified function call
    pub is_call: bool,
}

impl ColumnRef {
    pub fn qualifier(&self) -> &[String] {
        &self.parts[..self.parts.len() - 1]
    }

    pub fn column(&self) -> &str {
        &self.parts[self.parts.len() - 1]
    }

    pub fn is_wildcard(&self) -> bool {
        self.column() == "*"
    }

    pub fn display(&self) -> String {
        self.parts.join(".")
    }
}

/// Scan FROM/JOIN clauses of literal-masked SQL.
///
/// Recognizes `schema.table`, `"schema"."table"`, optional `AS alias`, comma lists
/// and JOIN chains at any nesting depth. Fails if no table reference is found.
pub fn extract_table_refs(masked: &str) -> Result<ParsedStatement, SqlGuardError> {
    let tokens = tokenize(masked);
    let mut parsed = ParsedStatement::default();

    // (function name before the paren, FROM clause active outside it)
    let mut parens: Vec<(Option<String>, bool)> = Vec::new();
    let mut in_from = false;
    let mut i = 0;

    while i < tokens.len() {
        let tok = &tokens[i];
        match tok.kind {
            TokenKind::LParen => {
                let func = i
                    .checked_sub(1)
                    .map(|p| &tokens[p])
                    .filter(|p| p.kind == TokenKind::Word)
                    .map(|p| p.lowered());
                parens.push((func, in_from));
                in_from = false;
                i += 1;
            }
            TokenKind::RParen => {
                if let Some((_, outer)) = parens.pop() {
                    in_from = outer;
                }
                i += 1;
                if let Some(alias) = alias_at(&tokens, i) {
                    parsed.derived_aliases.insert(alias.0);
                    i = alias.1;
                }
            }
            TokenKind::Comma if in_from => {
                i = table_ref_at(&tokens, i + 1, &mut parsed)?;
            }
            TokenKind::Word if tok.is_word("from") => {
                let in_func = parens
                    .last()
                    .and_then(|(f, _)| f.as_deref())
                    .map_or(false, |f| FROM_TAKING_FUNCTIONS.contains(&f));
                let after_distinct = i > 0 && tokens[i - 1].is_word("distinct");
                if in_func || after_distinct {
                    i += 1;
                    continue;
                }
                in_from = true;
                i = table_ref_at(&tokens, i + 1, &mut parsed)?;
            }
            TokenKind::Word if tok.is_word("join") => {
                in_from = true;
                i = table_ref_at(&tokens, i + 1, &mut parsed)?;
            }
            // `TABLE name` is shorthand for `SELECT * FROM name`
            TokenKind::Word if tok.is_word("table") && !follows_dot(&tokens, i) => {
                i = table_ref_at(&tokens, i + 1, &mut parsed)?;
            }
            TokenKind::Word if FROM_TERMINATORS.contains(&tok.lowered().as_str()) => {
                in_from = false;
                i += 1;
            }
            _ => i += 1,
        }
    }

    if parsed.tables_used.is_empty() && parsed.table_functions.is_empty() {
        return Err(SqlGuardError::NoTableFound);
    }

    Ok(parsed)
}

/// Parse one table reference starting at `i`; returns the index after it
fn table_ref_at(
    tokens: &[Token],
    mut i: usize,
    parsed: &mut ParsedStatement,
) -> Result<usize, SqlGuardError> {
    while tokens
        .get(i)
        .map_or(false, |t| t.is_word("only") || t.is_word("lateral"))
    {
        i += 1;
    }

    // Sub-selects are handled by the paren logic in the caller
    let first = match tokens.get(i) {
        Some(t) if t.is_identifier() => t,
        _ => return Ok(i),
    };

    let start = first.span.start;
    let mut end = first.span.end;
    let mut parts = vec![first.text.clone()];
    i += 1;
    while let (Some(dot), Some(next)) = (tokens.get(i), tokens.get(i + 1)) {
        if dot.kind != TokenKind::Dot || !next.is_identifier() {
            break;
        }
        parts.push(next.text.clone());
        end = next.span.end;
        i += 2;
    }

    let canonical = parts.iter().map(|p| canonical_part(p)).collect::<Vec<_>>().join(".");
    if tokens.get(i).map_or(false, |t| t.kind == TokenKind::LParen) {
        parsed.table_spans.push(start..end);
        parsed.table_functions.insert(canonical);
        return Ok(i);
    }

    let implicit = parts[parts.len() - 1].to_lowercase();

    let alias = match alias_at(tokens, i) {
        Some((alias, next)) => {
            i = next;
            alias
        }
        None => implicit,
    };

    parsed.table_spans.push(start..end);
    parsed.tables_used.insert(canonical.clone());
    parsed.alias_to_table.insert(alias, canonical);

    Ok(i)
}

fn follows_dot(tokens: &[Token], i: usize) -> bool {
    i > 0 && tokens[i - 1].kind == TokenKind::Dot
}

/// Lower-cased name part. A dot inside a quoted identifier belongs to the name,
/// so such a part stays quoted and can never read as `schema.table`.
fn canonical_part(part: &str) -> String {
    let lowered = part.to_lowercase();
    if lowered.contains('.') {
        quote_ident(&lowered)
    } else {
        lowered
    }
}

/// `[AS] alias` at `i`, returning the lower-cased alias and the index after it
fn alias_at(tokens: &[Token], i: usize) -> Option<(String, usize)> {
    let tok = tokens.get(i)?;
    if tok.is_word("as") {
        let alias = tokens.get(i + 1).filter(|t| t.is_identifier())?;
        return Some((alias.lowered(), i + 2));
    }
    if tok.is_alias_candidate() {
        return Some((tok.lowered(), i + 1));
    }
    None
}

/// Collect dotted references (`alias.column`, `schema.table.column`, `alias.*`)
/// that are not themselves FROM/JOIN table references.
pub fn extract_column_refs(masked: &str, parsed: &ParsedStatement) -> Vec<ColumnRef> {
    let tokens = tokenize(masked);
    let mut refs = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let tok = &tokens[i];
        let starts_chain = tok.is_identifier()
            && tokens.get(i + 1).map_or(false, |t| t.kind == TokenKind::Dot)
            && (i == 0 || tokens[i - 1].kind != TokenKind::Dot);

        if !starts_chain || parsed.covers(tok.span.start) {
            i += 1;
            continue;
        }

        let mut parts = vec![tok.lowered()];
        let mut j = i + 1;
        while let (Some(dot), Some(next)) = (tokens.get(j), tokens.get(j + 1)) {
            if dot.kind != TokenKind::Dot {
                break;
            }
            match next.kind {
                TokenKind::Word | TokenKind::QuotedIdent => parts.push(next.lowered()),
                TokenKind::Star => parts.push("*".to_string()),
                _ => break,
            }
            j += 2;
        }

        if parts.len() >= 2 {
            let is_call = tokens.get(j).map_or(false, |t| t.kind == TokenKind::LParen);
            refs.push(ColumnRef { parts, is_call });
        }
        i = j.max(i + 1);
    }

    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(sql: &str) -> ParsedStatement {
        extract_table_refs(&mask_literals(sql)).unwrap()
    }

    #[test]
    fn test_mask_literals_preserves_length() {
        let sql = "SELECT * FROM s.t WHERE name = 'it''s a DROP' AND x = 'é'";
        let masked = mask_literals(sql);
        assert_eq!(masked.len(), sql.len());
        assert!(!masked.contains("DROP"));
        assert!(masked.ends_with("x = '  '"));
    }

    #[test]
    fn test_mask_ignores_quotes_inside_identifiers() {
        let masked = mask_literals(r#"SELECT "it's" FROM s.t WHERE a = 'DELETE'"#);
        assert!(masked.contains(r#""it's""#));
        assert!(!masked.contains("DELETE"));
    }

    #[test]
    fn test_extract_aliases_and_joins() {
        let parsed = parse(
            r#"SELECT o.id, c.name FROM sales.orders AS o JOIN "Sales"."Customers" c ON o.cid = c.id"#,
        );
        assert_eq!(parsed.alias_to_table.get("o").map(String::as_str), Some("sales.orders"));
        assert_eq!(parsed.alias_to_table.get("c").map(String::as_str), Some("sales.customers"));
        assert_eq!(parsed.tables_used.len(), 2);
    }

    #[test]
    fn test_unaliased_table_gets_implicit_alias() {
        let parsed = parse("SELECT orders.id FROM sales.orders WHERE orders.total > 5");
        assert_eq!(
            parsed.alias_to_table.get("orders").map(String::as_str),
            Some("sales.orders")
        );
        assert!(!parsed.alias_to_table.contains_key("where"));
    }

    #[test]
    fn test_comma_lists_are_scanned() {
        let parsed = parse("SELECT * FROM sales.orders o, hr.salaries s WHERE o.id = s.id");
        assert!(parsed.tables_used.contains("hr.salaries"));

        let parsed =
            parse("SELECT * FROM sales.orders o JOIN sales.items i ON o.id = i.oid, hr.salaries s");
        assert!(parsed.tables_used.contains("hr.salaries"));
    }

    #[test]
    fn test_unqualified_tables_keep_bare_name() {
        let parsed = parse("SELECT * FROM sales.orders o JOIN customers c ON o.cid = c.id");
        assert!(parsed.tables_used.contains("customers"));
    }

    #[test]
    fn test_from_inside_extract_is_ignored() {
        let parsed = parse(
            "SELECT EXTRACT(YEAR FROM o.created_at) AS y, a IS DISTINCT FROM o.b FROM sales.orders o",
        );
        assert_eq!(parsed.tables_used.len(), 1);
        assert!(parsed.tables_used.contains("sales.orders"));
    }

    #[test]
    fn test_subquery_alias_is_derived() {
        let parsed = parse(
            "SELECT t.region FROM (SELECT o.region FROM sales.orders o) t WHERE t.region <> ''",
        );
        assert!(parsed.derived_aliases.contains("t"));
        assert!(parsed.tables_used.contains("sales.orders"));
    }

    #[test]
    fn test_no_table_is_an_error() {
        let err = extract_table_refs(&mask_literals("SELECT 1")).unwrap_err();
        assert_eq!(err, SqlGuardError::NoTableFound);
    }

    #[test]
    fn test_table_function_is_recorded() {
        let parsed = parse("SELECT * FROM generate_series(1, 10) g");
        assert!(parsed.table_functions.contains("generate_series"));
        assert!(parsed.tables_used.is_empty());
        assert!(parsed.derived_aliases.contains("g"));
    }

    #[test]
    fn test_column_refs_skip_table_positions() {
        let sql = "SELECT o.region, sales.orders.total, o.* FROM sales.orders o";
        let parsed = parse(sql);
        let refs = extract_column_refs(sql, &parsed);
        let shown: Vec<String> = refs.iter().map(ColumnRef::display).collect();
        assert_eq!(shown, vec!["o.region", "sales.orders.total", "o.*"]);
        assert!(refs[2].is_wildcard());
    }

    #[test]
    fn test_column_refs_flag_calls() {
        let sql = "SELECT public.leak(o.id) FROM sales.orders o";
        let parsed = parse(sql);
        let refs = extract_column_refs(sql, &parsed);
        assert!(refs[0].is_call);
        assert!(!refs[1].is_call);
    }

    #[test]
    fn test_table_statements_are_table_refs() {
        let parsed = parse("SELECT o.id FROM sales.orders o UNION ALL TABLE user_api_keys");
        assert!(parsed.tables_used.contains("user_api_keys"));

        let parsed = parse("SELECT o.id FROM sales.orders o WHERE o.id IN (TABLE ONLY hr.users)");
        assert!(parsed.tables_used.contains("hr.users"));

        let parsed = parse("SELECT o.table FROM sales.orders o");
        assert_eq!(parsed.tables_used.len(), 1);
    }

    #[test]
    fn test_quoted_dot_is_part_of_the_name() {
        let parsed = parse(r#"SELECT * FROM "sales.orders""#);
        assert_eq!(
            parsed.tables_used.iter().collect::<Vec<_>>(),
            vec![r#""sales.orders""#]
        );

        let parsed = parse(r#"SELECT * FROM "sales.x"."orders" o"#);
        assert_eq!(
            parsed.alias_to_table.get("o").map(String::as_str),
            Some(r#""sales.x".orders"#)
        );
    }

    #[test]
    fn test_paren_depths() {
        let depths = paren_depths("a(b)c");
        assert_eq!(depths, vec![0, 0, 1, 1, 0]);
    }
}
