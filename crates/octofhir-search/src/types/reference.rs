//! Reference search parameter implementation.
//!
//! Reference columns store the surrogate id of the referenced row. A value
//! whose id segment is already a storage id (UUID) is compared directly;
//! any other id is a natural key and is resolved through the target table's
//! `fhir_id` column.

use crate::sql_builder::{Predicate, SqlParam, resource_table};

/// Check if a string looks like a FHIR resource type name.
pub fn is_resource_type(s: &str) -> bool {
    s.starts_with(|c: char| c.is_ascii_uppercase()) && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Check if an id is a storage-native surrogate id.
pub fn is_storage_id(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

/// Split `[base/]Type/id` into the optional type and the id.
pub fn split_reference(value: &str) -> (Option<&str>, &str) {
    let trimmed = value.trim().trim_end_matches('/');
    let mut segments = trimmed.rsplitn(3, '/');
    let id = segments.next().unwrap_or_default();
    match segments.next() {
        Some(resource_type) if is_resource_type(resource_type) => (Some(resource_type), id),
        _ => (None, trimmed),
    }
}

/// Default reference match.
///
/// The type named in the value wins over the configured target type. A
/// natural-key value with no resolvable type never matches.
pub fn reference_predicate(
    column: &str,
    target_type: Option<&str>,
    value: &str,
    start: usize,
) -> Predicate {
    let (value_type, id) = split_reference(value);
    if id.is_empty() {
        return Predicate::always_false();
    }

    if is_storage_id(id) {
        return Predicate::new(format!("{column} = ${start}"), vec![SqlParam::text(id)]);
    }

    match value_type.or(target_type).filter(|t| is_resource_type(t)) {
        Some(resource_type) => Predicate::new(
            format!(
                "{column} = (SELECT id FROM {} WHERE fhir_id = ${start})",
                resource_table(resource_type)
            ),
            vec![SqlParam::text(id)],
        ),
        None => {
            tracing::debug!(column, value, "reference target type is unknown");
            Predicate::always_false()
        }
    }
}
