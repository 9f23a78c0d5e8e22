//! Reverse chaining (_has) implementation for FHIR search.
//!
//! Reverse chaining allows searching for resources based on other resources
//! that reference them.
//!
//! Example: `Patient?_has:Observation:patient:code=1234`
//! Finds patients that have observations with code 1234, compiled as
//! `id IN (SELECT patient FROM observations WHERE code = $1)`.
//!
//! Nested `_has` (`_has:A:b:_has:C:d:e`) is not supported.

use crate::parameters::SearchParameterType;
use crate::registry::SearchParameterRegistry;
use crate::sql_builder::{Predicate, SqlBuilderError, resource_table, validate_identifier};
use crate::types::{LeafColumn, is_resource_type, leaf_predicate_any};
use serde::{Deserialize, Serialize};

/// Error type for reverse chaining operations.
#[derive(Debug, thiserror::Error)]
pub enum ReverseChainingError {
    #[error("Invalid _has parameter: {0}")]
    InvalidHas(String),

    #[error("Nested _has is not supported: {0}")]
    NestedHas(String),

    #[error("Parameter {0} is not a reference type")]
    NotReferenceType(String),

    #[error("SQL builder error: {0}")]
    SqlBuilder(#[from] SqlBuilderError),
}

/// The three named components of `_has:Type:refParam:searchParam`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasPath {
    /// The resource type that references the searched resource.
    pub target_type: String,
    /// The reference parameter on `target_type`.
    pub reference_param: String,
    /// The parameter filtered on `target_type`.
    pub search_param: String,
}

/// Storage mapping for one reverse-chain leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseChainConfig {
    /// Table of the referencing resource.
    pub target_table: String,
    /// Column on `target_table` that references the searched resource.
    pub reference_column: String,
    /// Column on `target_table` compared with the value.
    pub search_column: String,
    pub kind: SearchParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_column: Option<String>,
    /// Resource type a reference leaf points at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_target_type: Option<String>,
}

/// Check if a parameter name is a reverse chain (_has) parameter.
pub fn is_reverse_chain_parameter(name: &str) -> bool {
    name.starts_with("_has:")
}

/// Parse `_has:Type:referenceParam:searchParam`.
pub fn parse_has(name: &str) -> Result<HasPath, ReverseChainingError> {
    let Some(rest) = name.strip_prefix("_has:") else {
        return Err(ReverseChainingError::InvalidHas(
            "Parameter must start with _has:".to_string(),
        ));
    };

    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() < 3 {
        return Err(ReverseChainingError::InvalidHas(
            "_has requires Type:referenceParam:searchParam format".to_string(),
        ));
    }
    if parts.len() > 3 {
        if parts.contains(&"_has") {
            return Err(ReverseChainingError::NestedHas(name.to_string()));
        }
        return Err(ReverseChainingError::InvalidHas(format!(
            "{name}: modifiers are not supported on _has parameters"
        )));
    }

    let [target_type, reference_param, search_param] = [parts[0], parts[1], parts[2]];
    if !is_resource_type(target_type) {
        return Err(ReverseChainingError::InvalidHas(format!(
            "{target_type} is not a resource type"
        )));
    }
    if reference_param.is_empty() || search_param.is_empty() {
        return Err(ReverseChainingError::InvalidHas(format!(
            "{name}: empty parameter name"
        )));
    }

    Ok(HasPath {
        target_type: target_type.to_string(),
        reference_param: reference_param.to_string(),
        search_param: search_param.to_string(),
    })
}

/// Map a parsed `_has` onto storage columns.
///
/// Registered parameters of `target_type` supply columns and kinds. An
/// unregistered reference parameter is used as the column name; an
/// unregistered search parameter is used as a token column.
pub fn resolve_has(
    path: &HasPath,
    registry: &SearchParameterRegistry,
) -> Result<ReverseChainConfig, ReverseChainingError> {
    let reference_column = match registry.get(&path.target_type, &path.reference_param) {
        Some(param) if param.kind != SearchParameterType::Reference => {
            return Err(ReverseChainingError::NotReferenceType(
                path.reference_param.clone(),
            ));
        }
        Some(param) => param.column.clone(),
        None => path.reference_param.clone(),
    };

    let (search_column, kind, system_column, leaf_target_type) =
        match registry.get(&path.target_type, &path.search_param) {
            Some(param) => (
                param.column.clone(),
                param.kind,
                param.system_column.clone(),
                param.target_type.clone(),
            ),
            None => (path.search_param.clone(), SearchParameterType::Token, None, None),
        };

    Ok(ReverseChainConfig {
        target_table: resource_table(&path.target_type),
        reference_column,
        search_column,
        kind,
        system_column,
        leaf_target_type,
    })
}

/// `source_id_column IN (SELECT reference_column FROM target_table WHERE <leaf>)`.
pub fn reverse_chain_clause(
    source_id_column: &str,
    config: &ReverseChainConfig,
    value: &str,
    start: usize,
) -> Result<Predicate, ReverseChainingError> {
    validate_identifier(source_id_column)?;
    validate_identifier(&config.target_table)?;
    validate_identifier(&config.reference_column)?;
    validate_identifier(&config.search_column)?;
    if let Some(system) = &config.system_column {
        validate_identifier(system)?;
    }

    let leaf = LeafColumn::new(&config.search_column, config.kind)
        .with_system_column(config.system_column.as_deref())
        .with_target_type(config.leaf_target_type.as_deref());
    let inner = leaf_predicate_any(&leaf, value, start);

    let sql = format!(
        "{source_id_column} IN (SELECT {} FROM {} WHERE {})",
        config.reference_column, config.target_table, inner.sql
    );
    tracing::debug!(sql = %sql, "compiled reverse chain");
    Ok(Predicate::new(sql, inner.params))
}
