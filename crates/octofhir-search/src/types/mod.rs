//! Unmodified value matching for FHIR search parameter kinds.
//!
//! This module provides the leaf predicates shared by plain field parameters,
//! chain leaves and `_has` leaves:
//! - String: case-insensitive starts-with
//! - Token: `system|code` equality
//! - Number: comparison prefixes
//! - Date: comparison prefixes with precision ranges
//! - Reference: storage id or natural-key subquery
//! - URI: equality
//!
//! Each builder takes the placeholder index it starts at and returns a
//! [`Predicate`] whose bind values line up with it.

pub mod date;
pub mod number;
pub mod reference;
pub mod string;
pub mod token;
pub mod uri;

pub use date::{DateRange, date_predicate, parse_date_range};
pub use number::number_predicate;
pub use reference::{is_resource_type, is_storage_id, reference_predicate, split_reference};
pub use string::{contains_predicate, exact_predicate, string_predicate};
pub use token::{TokenValue, parse_token_value, token_predicate};
pub use uri::uri_predicate;

use crate::parameters::{SearchParamConfig, SearchParameterType};
use crate::sql_builder::Predicate;

/// The storage side of a leaf comparison.
#[derive(Debug, Clone, Copy)]
pub struct LeafColumn<'a> {
    pub column: &'a str,
    pub kind: SearchParameterType,
    pub system_column: Option<&'a str>,
    pub target_type: Option<&'a str>,
}

impl<'a> LeafColumn<'a> {
    pub fn new(column: &'a str, kind: SearchParameterType) -> Self {
        Self {
            column,
            kind,
            system_column: None,
            target_type: None,
        }
    }

    #[must_use]
    pub fn with_system_column(mut self, system_column: Option<&'a str>) -> Self {
        self.system_column = system_column;
        self
    }

    #[must_use]
    pub fn with_target_type(mut self, target_type: Option<&'a str>) -> Self {
        self.target_type = target_type;
        self
    }
}

impl<'a> From<&'a SearchParamConfig> for LeafColumn<'a> {
    fn from(config: &'a SearchParamConfig) -> Self {
        Self {
            column: &config.column,
            kind: config.kind,
            system_column: config.system_column.as_deref(),
            target_type: config.target_type.as_deref(),
        }
    }
}

/// Match a single value against a leaf column.
pub fn leaf_predicate(leaf: &LeafColumn<'_>, value: &str, start: usize) -> Predicate {
    match leaf.kind {
        SearchParameterType::String => string_predicate(leaf.column, value, start),
        SearchParameterType::Token => {
            token_predicate(leaf.column, leaf.system_column, value, start)
        }
        SearchParameterType::Date => date_predicate(leaf.column, value, start),
        SearchParameterType::Number => number_predicate(leaf.column, value, start),
        SearchParameterType::Reference => {
            reference_predicate(leaf.column, leaf.target_type, value, start)
        }
        SearchParameterType::Uri => uri_predicate(leaf.column, value, start),
    }
}

/// Match a possibly comma-separated value list; the alternatives are ORed and
/// numbered back to back from `start`.
pub fn leaf_predicate_any(leaf: &LeafColumn<'_>, value: &str, start: usize) -> Predicate {
    any_value(value, start, |v, idx| leaf_predicate(leaf, v, idx))
}

/// Split `value` on commas and OR the per-value predicates produced by `build`,
/// threading the placeholder index through each call.
pub fn any_value<F>(value: &str, start: usize, mut build: F) -> Predicate
where
    F: FnMut(&str, usize) -> Predicate,
{
    let mut next = start;
    let mut parts = Vec::new();
    for v in value.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let part = build(v, next);
        next += part.arg_count();
        parts.push(part);
    }
    Predicate::any(parts)
}
