//! Number search parameter implementation.
//!
//! Values take an optional comparison prefix (`eq` default, `ne`, `gt`,
//! `ge`, `lt`, `le`). Values that do not parse as a finite number never match.

use crate::parameters::SearchPrefix;
use crate::sql_builder::{Predicate, SqlParam};

pub fn number_predicate(column: &str, value: &str, start: usize) -> Predicate {
    let (prefix, raw) = SearchPrefix::split(value);
    let Some(param) = parse_number(raw) else {
        tracing::debug!(column, value, "unmatchable number value");
        return Predicate::always_false();
    };

    Predicate::new(
        format!("{column} {} ${start}", prefix.sql_operator()),
        vec![param],
    )
}

fn parse_number(raw: &str) -> Option<SqlParam> {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Some(SqlParam::Integer(i));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(SqlParam::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_default_is_eq() {
        let pred = number_predicate("probability", "5", 1);
        assert_eq!(pred.sql, "probability = $1");
        assert_eq!(pred.params, vec![SqlParam::Integer(5)]);
    }

    #[test]
    fn test_number_prefixes() {
        let pred = number_predicate("probability", "gt0.8", 2);
        assert_eq!(pred.sql, "probability > $2");
        assert_eq!(pred.params, vec![SqlParam::Float(0.8)]);

        assert_eq!(number_predicate("n", "le10", 1).sql, "n <= $1");
        assert_eq!(number_predicate("n", "ne10", 1).sql, "n <> $1");
    }

    #[test]
    fn test_invalid_number_matches_nothing() {
        assert!(number_predicate("n", "abc", 1).is_always_false());
        assert!(number_predicate("n", "gtNaN", 1).is_always_false());
        assert!(number_predicate("n", "inf", 1).is_always_false());
    }
}
