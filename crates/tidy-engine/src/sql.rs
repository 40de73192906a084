//! Identifier handling shared by every phase.
//!
//! Table and column names are only ever taken from a validated
//! [`SchemaCatalog`](crate::SchemaCatalog) or from the database's own
//! catalog; every value-level predicate is a bind parameter.

const MAX_IDENTIFIER_LEN: usize = 63;

pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}
