//! String search parameter implementation.
//!
//! String search supports the following forms:
//! - (default): starts-with, case-insensitive
//! - :exact: exact match, case-sensitive
//! - :contains: contains, case-insensitive

use crate::sql_builder::{Predicate, SqlParam};

/// Default string match: case-insensitive starts-with.
pub fn string_predicate(column: &str, value: &str, start: usize) -> Predicate {
    Predicate::new(
        format!("{column} ILIKE ${start}"),
        vec![SqlParam::Text(format!("{}%", escape_like_pattern(value)))],
    )
}

pub fn exact_predicate(column: &str, value: &str, start: usize) -> Predicate {
    Predicate::new(
        format!("{column} = ${start}"),
        vec![SqlParam::text(value)],
    )
}

pub fn contains_predicate(column: &str, value: &str, start: usize) -> Predicate {
    Predicate::new(
        format!("{column} ILIKE ${start}"),
        vec![SqlParam::Text(format!("%{}%", escape_like_pattern(value)))],
    )
}

/// Escape special characters in LIKE patterns.
pub(crate) fn escape_like_pattern(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
