//! `{table}` placeholder substitution for dataset queries

/// Token the generator emits for "the selected dataset's table"
pub const TABLE_PLACEHOLDER: &str = "{table}";

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `"schema"."table"` with both parts quoted
pub fn qualified_table_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

pub fn contains_placeholder(sql: &str) -> bool {
    sql.contains(TABLE_PLACEHOLDER)
}

/// Replace every placeholder occurrence with an already-quoted table name
pub fn substitute_placeholder(sql: &str, qualified: &str) -> String {
    sql.replace(TABLE_PLACEHOLDER, qualified)
}
