//! Search parameter and chain registries.
//!
//! Both registries are long-lived and read-mostly: they are filled at
//! start-up and read on every request. Each is an explicit instance guarded
//! by an `RwLock` and shared through `Arc`; there is no process-global state.
//!
//! A poisoned lock is recovered rather than propagated, since every write is
//! a single map insert and cannot leave the map half-updated.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::chaining::{
    ChainPath, ChainedSearchConfig, ChainingError, MAX_CHAIN_DEPTH, parse_chain_path,
};
use crate::parameters::{SearchParamConfig, SearchParameterType};
use crate::sql_builder::resource_table;

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of searchable fields per resource type.
///
/// Lookups check resource-specific parameters first, then the common
/// parameters that apply to every resource type.
#[derive(Debug, Default)]
pub struct SearchParameterRegistry {
    /// Parameters indexed by (resource_type, code)
    by_resource: RwLock<HashMap<(String, String), Arc<SearchParamConfig>>>,
    /// Common parameters (apply to all resources)
    common: RwLock<HashMap<String, Arc<SearchParamConfig>>>,
}

impl SearchParameterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter for one resource type, replacing any previous
    /// definition with the same code.
    pub fn register(&self, resource_type: impl Into<String>, config: SearchParamConfig) {
        let resource_type = resource_type.into();
        tracing::debug!(
            resource_type = %resource_type,
            code = %config.name,
            column = %config.column,
            kind = %config.kind,
            "registered search parameter"
        );
        write(&self.by_resource).insert((resource_type, config.name.clone()), Arc::new(config));
    }

    /// Register a parameter that applies to every resource type.
    pub fn register_common(&self, config: SearchParamConfig) {
        write(&self.common).insert(config.name.clone(), Arc::new(config));
    }

    /// Get a search parameter for a specific resource type and code.
    pub fn get(&self, resource_type: &str, code: &str) -> Option<Arc<SearchParamConfig>> {
        let key = (resource_type.to_string(), code.to_string());
        if let Some(param) = read(&self.by_resource).get(&key) {
            return Some(param.clone());
        }
        read(&self.common).get(code).cloned()
    }

    /// Get all search parameters applicable to a resource type, common ones
    /// included. Resource-specific definitions shadow common ones.
    pub fn get_all_for_type(&self, resource_type: &str) -> Vec<Arc<SearchParamConfig>> {
        let mut params: HashMap<String, Arc<SearchParamConfig>> = read(&self.common).clone();
        params.extend(
            read(&self.by_resource)
                .iter()
                .filter(|((rt, _), _)| rt == resource_type)
                .map(|((_, code), param)| (code.clone(), param.clone())),
        );
        let mut params: Vec<_> = params.into_values().collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }

    /// Get the total number of registered parameters.
    pub fn len(&self) -> usize {
        read(&self.by_resource).len() + read(&self.common).len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry of chain hops keyed by `(source resource type, chain path)`.
///
/// A path is either a flattened entry (`"patient.name"`, carrying the leaf
/// column) or a single reference parameter (`"subject"`) registered as an
/// intermediate hop with a target type. [`ChainRegistry::resolve`] combines
/// both to decompose longer dotted paths.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    entries: RwLock<HashMap<(String, String), Arc<ChainedSearchConfig>>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        source_type: impl Into<String>,
        path: impl Into<String>,
        config: ChainedSearchConfig,
    ) {
        let source_type = source_type.into();
        let path = path.into();
        tracing::debug!(
            source_type = %source_type,
            path = %path,
            target_table = %config.target_table,
            intermediate = config.is_intermediate(),
            "registered chain"
        );
        write(&self.entries).insert((source_type, path), Arc::new(config));
    }

    pub fn get(&self, source_type: &str, path: &str) -> Option<Arc<ChainedSearchConfig>> {
        read(&self.entries)
            .get(&(source_type.to_string(), path.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a chained parameter name into its ordered hops.
    ///
    /// A flattened entry for the whole path wins. Otherwise the first segment
    /// is resolved to an intermediate hop (a registered hop, or a reference
    /// parameter with a known target type) and the remainder is resolved
    /// against the hop's target type; a final single field is looked up in
    /// `params`. More than [`MAX_CHAIN_DEPTH`] hops is an error.
    pub fn resolve(
        &self,
        params: &SearchParameterRegistry,
        source_type: &str,
        path: &str,
    ) -> Result<Vec<ChainedSearchConfig>, ChainingError> {
        let depth = path.matches('.').count();
        if depth > MAX_CHAIN_DEPTH {
            return Err(ChainingError::DepthExceeded {
                depth,
                max: MAX_CHAIN_DEPTH,
            });
        }

        let mut hops = Vec::with_capacity(depth);
        self.resolve_into(params, source_type, path, &mut hops)?;
        tracing::debug!(source_type, path, hops = hops.len(), "resolved chain");
        Ok(hops)
    }

    fn resolve_into(
        &self,
        params: &SearchParameterRegistry,
        source_type: &str,
        path: &str,
        hops: &mut Vec<ChainedSearchConfig>,
    ) -> Result<(), ChainingError> {
        let parsed = parse_chain_path(path)?;

        let normalized = format!("{}.{}", parsed.source_param, parsed.target_field);
        let flattened = self
            .get(source_type, path)
            .or_else(|| self.get(source_type, &normalized))
            .filter(|config| !config.is_intermediate());
        if let Some(config) = flattened {
            check_asserted_type(&parsed, &config)?;
            hops.push((*config).clone());
            return Ok(());
        }

        let hop = self
            .intermediate_hop(params, source_type, &parsed)
            .ok_or_else(|| ChainingError::UnknownChain {
                resource_type: source_type.to_string(),
                path: path.to_string(),
            })?;
        check_asserted_type(&parsed, &hop)?;
        let next_type = parsed
            .target_type
            .clone()
            .or_else(|| hop.target_type.clone())
            .ok_or_else(|| {
                ChainingError::InvalidChain(format!(
                    "{}: target type is ambiguous, use :Type",
                    parsed.source_param
                ))
            })?;

        match parsed.target_field.split_once('.') {
            Some(_) => {
                hops.push(hop);
                self.resolve_into(params, &next_type, &parsed.target_field, hops)
            }
            None => {
                let leaf = params.get(&next_type, &parsed.target_field).ok_or_else(|| {
                    ChainingError::UnknownChain {
                        resource_type: next_type.clone(),
                        path: parsed.target_field.clone(),
                    }
                })?;
                hops.push(ChainedSearchConfig {
                    target_column: leaf.column.clone(),
                    kind: leaf.kind,
                    target_system_column: leaf.system_column.clone(),
                    leaf_target_type: leaf.target_type.clone(),
                    ..hop
                });
                Ok(())
            }
        }
    }

    fn intermediate_hop(
        &self,
        params: &SearchParameterRegistry,
        source_type: &str,
        parsed: &ChainPath,
    ) -> Option<ChainedSearchConfig> {
        if let Some(hop) = self
            .get(source_type, &parsed.source_param)
            .filter(|config| config.is_intermediate())
        {
            return Some((*hop).clone());
        }

        let param = params
            .get(source_type, &parsed.source_param)
            .filter(|p| p.kind == SearchParameterType::Reference)?;
        let target = param.target_type.clone().or(parsed.target_type.clone())?;
        Some(ChainedSearchConfig::hop(
            param.column.clone(),
            resource_table(&target),
            target,
        ))
    }
}

fn check_asserted_type(
    parsed: &ChainPath,
    config: &ChainedSearchConfig,
) -> Result<(), ChainingError> {
    match (&parsed.target_type, &config.target_type) {
        (Some(asserted), Some(configured)) if asserted != configured => {
            Err(ChainingError::TargetTypeMismatch {
                param: parsed.source_param.clone(),
                asserted: asserted.clone(),
                configured: configured.clone(),
            })
        }
        _ => Ok(()),
    }
}
