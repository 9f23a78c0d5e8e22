//! URI search parameter implementation. URIs match by exact equality.

use crate::sql_builder::{Predicate, SqlParam};

pub fn uri_predicate(column: &str, value: &str, start: usize) -> Predicate {
    Predicate::new(format!("{column} = ${start}"), vec![SqlParam::text(value)])
}
