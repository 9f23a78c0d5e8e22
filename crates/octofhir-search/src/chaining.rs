//! Search chaining implementation for FHIR search.
//!
//! This module implements forward chaining for reference parameters.
//! Chaining allows searching on properties of referenced resources.
//!
//! Examples:
//! - `Observation?patient.name=Smith` - Find observations where patient's name is Smith
//! - `Observation?subject:Patient.name=Smith` - Explicit type modifier
//!
//! Each hop becomes `reference_column IN (SELECT id FROM target_table WHERE ...)`,
//! nested once per hop. Only the leaf binds values, so nesting never shifts
//! placeholder numbers.

use crate::parameters::SearchParameterType;
use crate::sql_builder::{Predicate, SqlBuilderError, validate_identifier};
use crate::types::{LeafColumn, leaf_predicate_any};
use serde::{Deserialize, Serialize};

/// Maximum number of hops in one chained parameter.
pub const MAX_CHAIN_DEPTH: usize = 3;

/// Error type for chaining operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainingError {
    #[error("Invalid chained parameter: {0}")]
    InvalidChain(String),

    #[error("Unknown chain {path} on {resource_type}")]
    UnknownChain { resource_type: String, path: String },

    #[error("Chain depth {depth} exceeds maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("Chain leaf {0} has no target column")]
    MissingLeafColumn(String),

    #[error("Chain asserts target type {asserted} but {param} targets {configured}")]
    TargetTypeMismatch {
        param: String,
        asserted: String,
        configured: String,
    },

    #[error("SQL builder error: {0}")]
    SqlBuilder(#[from] SqlBuilderError),
}

/// One hop of a cross-resource chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedSearchConfig {
    /// Column on the source table holding the reference.
    pub reference_column: String,
    /// Table of the referenced resource.
    pub target_table: String,
    /// Leaf column on the target table; empty for intermediate hops.
    #[serde(default)]
    pub target_column: String,
    /// Kind of the leaf column.
    pub kind: SearchParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_system_column: Option<String>,
    /// Resource type stored in `target_table`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    /// Resource type a reference leaf points at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_target_type: Option<String>,
}

impl ChainedSearchConfig {
    /// A leaf hop that compares `target_column`.
    pub fn new(
        reference_column: impl Into<String>,
        target_table: impl Into<String>,
        target_column: impl Into<String>,
        kind: SearchParameterType,
    ) -> Self {
        Self {
            reference_column: reference_column.into(),
            target_table: target_table.into(),
            target_column: target_column.into(),
            kind,
            target_system_column: None,
            target_type: None,
            leaf_target_type: None,
        }
    }

    /// An intermediate hop into `target_type`, used for path decomposition.
    pub fn hop(
        reference_column: impl Into<String>,
        target_table: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        Self {
            reference_column: reference_column.into(),
            target_table: target_table.into(),
            target_column: String::new(),
            kind: SearchParameterType::Reference,
            target_system_column: None,
            target_type: Some(target_type.into()),
            leaf_target_type: None,
        }
    }

    #[must_use]
    pub fn with_target_system_column(mut self, column: impl Into<String>) -> Self {
        self.target_system_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn with_target_type(mut self, target_type: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self
    }

    #[must_use]
    pub fn with_leaf_target_type(mut self, target_type: impl Into<String>) -> Self {
        self.leaf_target_type = Some(target_type.into());
        self
    }

    pub fn is_intermediate(&self) -> bool {
        self.target_column.is_empty()
    }

    fn leaf(&self) -> LeafColumn<'_> {
        LeafColumn::new(&self.target_column, self.kind)
            .with_system_column(self.target_system_column.as_deref())
            .with_target_type(self.leaf_target_type.as_deref())
    }

    fn validate(&self) -> Result<(), SqlBuilderError> {
        validate_identifier(&self.reference_column)?;
        validate_identifier(&self.target_table)?;
        if !self.is_intermediate() {
            validate_identifier(&self.target_column)?;
        }
        if let Some(system) = &self.target_system_column {
            validate_identifier(system)?;
        }
        Ok(())
    }
}

/// A chained parameter name split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPath {
    /// The reference parameter on the searched resource (e.g. "subject").
    pub source_param: String,
    /// The asserted target type from `subject:Patient.name`.
    pub target_type: Option<String>,
    /// Everything after the first dot (e.g. "name" or "organization.name").
    pub target_field: String,
}

/// Parse `source.field` or `source:Type.field`.
pub fn parse_chain_path(name: &str) -> Result<ChainPath, ChainingError> {
    let Some((head, field)) = name.split_once('.') else {
        return Err(ChainingError::InvalidChain(format!(
            "{name}: chained parameter requires at least two parts"
        )));
    };

    let (source, target_type) = parse_parameter_with_type(head);
    if source.is_empty() || field.is_empty() || field.split('.').any(str::is_empty) {
        return Err(ChainingError::InvalidChain(format!("{name}: empty path segment")));
    }
    if target_type.is_some_and(str::is_empty) {
        return Err(ChainingError::InvalidChain(format!("{name}: empty target type")));
    }

    Ok(ChainPath {
        source_param: source.to_string(),
        target_type: target_type.map(str::to_string),
        target_field: field.to_string(),
    })
}

/// Parse a parameter name that may have a :Type modifier.
pub(crate) fn parse_parameter_with_type(part: &str) -> (&str, Option<&str>) {
    match part.split_once(':') {
        Some((name, target_type)) => (name, Some(target_type)),
        None => (part, None),
    }
}

/// Check if a parameter name contains a chained reference (has a dot).
pub fn is_chained_parameter(name: &str) -> bool {
    // Exclude special parameters that have dots but aren't chains
    !name.starts_with('_') && name.contains('.')
}

/// Single-level chain:
/// `reference_column IN (SELECT id FROM target_table WHERE <leaf>)`.
pub fn chained_search_clause(
    config: &ChainedSearchConfig,
    value: &str,
    start: usize,
) -> Result<Predicate, ChainingError> {
    multi_level_chained_search_clause(std::slice::from_ref(config), value, start)
}

/// Multi-level chain: hop 1 is nearest the searched resource, the last hop
/// carries the leaf column. At most [`MAX_CHAIN_DEPTH`] hops.
pub fn multi_level_chained_search_clause(
    configs: &[ChainedSearchConfig],
    value: &str,
    start: usize,
) -> Result<Predicate, ChainingError> {
    let Some(leaf_hop) = configs.last() else {
        return Err(ChainingError::InvalidChain("Empty chain".to_string()));
    };
    if configs.len() > MAX_CHAIN_DEPTH {
        return Err(ChainingError::DepthExceeded {
            depth: configs.len(),
            max: MAX_CHAIN_DEPTH,
        });
    }
    if leaf_hop.is_intermediate() {
        return Err(ChainingError::MissingLeafColumn(
            leaf_hop.target_table.clone(),
        ));
    }
    for config in configs {
        config.validate()?;
    }

    let leaf = leaf_predicate_any(&leaf_hop.leaf(), value, start);
    let mut sql = leaf.sql;
    for hop in configs.iter().rev() {
        sql = format!(
            "{} IN (SELECT id FROM {} WHERE {sql})",
            hop.reference_column, hop.target_table
        );
    }

    tracing::debug!(hops = configs.len(), sql = %sql, "compiled chained search");
    Ok(Predicate::new(sql, leaf.params))
}
