//! Token search parameter implementation.
//!
//! Token search is used for coded elements stored as a code column with an
//! optional system column. Value formats:
//! - `system|code` - match both system and code
//! - `system|` - match the system only
//! - `|code` - match the code only
//! - `code` - match the code in any system
//!
//! Without a system column only the code half can be compared.

use crate::sql_builder::{Predicate, SqlParam};

/// The two halves of a token value. Empty halves are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenValue<'a> {
    pub system: Option<&'a str>,
    pub code: Option<&'a str>,
}

/// Parse a token value into system and code parts.
pub fn parse_token_value(value: &str) -> TokenValue<'_> {
    fn non_empty(s: &str) -> Option<&str> {
        (!s.is_empty()).then_some(s)
    }
    match value.split_once('|') {
        Some((system, code)) => TokenValue {
            system: non_empty(system),
            code: non_empty(code),
        },
        None => TokenValue {
            system: None,
            code: non_empty(value),
        },
    }
}

/// Equality match on a token value, or `None` when no half of the value can
/// be compared against the available columns.
pub(crate) fn token_equality(
    code_column: &str,
    system_column: Option<&str>,
    value: &str,
    start: usize,
) -> Option<Predicate> {
    let token = parse_token_value(value);
    match (token.system, token.code, system_column) {
        (Some(system), Some(code), Some(system_column)) => Some(Predicate::new(
            format!(
                "({system_column} = ${start} AND {code_column} = ${})",
                start + 1
            ),
            vec![SqlParam::text(system), SqlParam::text(code)],
        )),
        (_, Some(code), _) => Some(Predicate::new(
            format!("{code_column} = ${start}"),
            vec![SqlParam::text(code)],
        )),
        (Some(system), None, Some(system_column)) => Some(Predicate::new(
            format!("{system_column} = ${start}"),
            vec![SqlParam::text(system)],
        )),
        _ => None,
    }
}

/// Default token match. Values with nothing comparable never match.
pub fn token_predicate(
    code_column: &str,
    system_column: Option<&str>,
    value: &str,
    start: usize,
) -> Predicate {
    token_equality(code_column, system_column, value, start).unwrap_or_else(|| {
        tracing::debug!(column = code_column, value, "token value has no comparable part");
        Predicate::always_false()
    })
}
