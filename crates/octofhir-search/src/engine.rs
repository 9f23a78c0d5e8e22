//! Search compiler: from a FHIR query string to one parameterized SELECT.

use std::sync::Arc;
use url::Url;

use crate::chaining::multi_level_chained_search_clause;
use crate::config::{ConfigError, PaginationConfig};
use crate::error::SearchError;
use crate::keyset::{ID_COLUMN, SortKey};
use crate::modifiers::compile_modified_parameter;
use crate::pagination::{BoundaryRow, Page, PageRequest, Paginator};
use crate::parameters::split_modifier;
use crate::parser::{FilterKind, FilterParam, ParsedQuery, SearchParameterParser};
use crate::registry::{ChainRegistry, SearchParameterRegistry};
use crate::reverse_chaining::{parse_has, resolve_has, reverse_chain_clause};
use crate::sql_builder::{
    BuiltQuery, Predicate, QueryBuilder, resource_table, validate_identifier,
};
use crate::terminology::{ValueSetExpander, expand_value_set_params};
use crate::types::{LeafColumn, is_resource_type, leaf_predicate_any};

/// Columns every search selects.
pub const BASE_COLUMNS: &[&str] = &["id", "fhir_id", "version_id", "last_updated", "resource"];

/// Sort fields whose columns are never NULL.
const NOT_NULL_SORT_FIELDS: &[&str] = &["_lastUpdated", "_id"];

/// A compiled search: the statement to run and the page it fetches.
#[derive(Debug, Clone)]
pub struct CompiledSearch {
    pub query: BuiltQuery,
    pub page: PageRequest,
}

/// Compiles searches against shared registries.
///
/// Cheap to clone; registries are shared and read-only per request.
#[derive(Debug, Clone)]
pub struct SearchCompiler {
    params: Arc<SearchParameterRegistry>,
    chains: Arc<ChainRegistry>,
    paginator: Paginator,
}

impl SearchCompiler {
    pub fn new(
        params: Arc<SearchParameterRegistry>,
        chains: Arc<ChainRegistry>,
        config: PaginationConfig,
    ) -> Result<Self, SearchError> {
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(Self {
            params,
            chains,
            paginator: Paginator::new(config)?,
        })
    }

    pub fn params(&self) -> &SearchParameterRegistry {
        &self.params
    }

    pub fn paginator(&self) -> &Paginator {
        &self.paginator
    }

    /// Compile `query` (a URL query string) for `resource_type`.
    pub fn compile(&self, resource_type: &str, query: &str) -> Result<CompiledSearch, SearchError> {
        let parsed = SearchParameterParser::parse_query(query);
        self.compile_parsed(resource_type, &parsed)
    }

    /// Compile and expand `:in` / `:not-in` ValueSets into code arrays.
    pub async fn compile_expanded(
        &self,
        resource_type: &str,
        query: &str,
        expander: &dyn ValueSetExpander,
    ) -> Result<CompiledSearch, SearchError> {
        let mut compiled = self.compile(resource_type, query)?;
        expand_value_set_params(&mut compiled.query.params, expander).await?;
        Ok(compiled)
    }

    pub fn compile_parsed(
        &self,
        resource_type: &str,
        parsed: &ParsedQuery,
    ) -> Result<CompiledSearch, SearchError> {
        if !is_resource_type(resource_type) {
            return Err(SearchError::InvalidResourceType(resource_type.to_string()));
        }

        let sort = self.sort_keys(resource_type, parsed.paging.sort.as_deref())?;
        let page = self.paginator.request(&parsed.paging, &sort)?;

        let mut columns: Vec<&str> = BASE_COLUMNS.to_vec();
        for key in &page.sort {
            if !columns.contains(&key.column.as_str()) {
                columns.push(&key.column);
            }
        }
        let mut builder =
            QueryBuilder::new(resource_table(resource_type))?.with_columns(columns)?;

        for filter in &parsed.filters {
            let predicate = self.compile_filter(resource_type, filter, builder.idx())?;
            builder.push(predicate);
        }
        page.apply(&mut builder)?;

        let query = builder.build()?;
        tracing::debug!(
            resource_type,
            sql = %query.sql,
            args = query.params.len(),
            count = page.count,
            "compiled search"
        );
        Ok(CompiledSearch { query, page })
    }

    /// Trim, order and link the rows fetched for `compiled`.
    pub fn finish_page<R: BoundaryRow>(
        &self,
        compiled: &CompiledSearch,
        rows: Vec<R>,
        base: &Url,
    ) -> Result<Page<R>, SearchError> {
        Ok(self.paginator.finish_page(&compiled.page, rows, base)?)
    }

    fn compile_filter(
        &self,
        resource_type: &str,
        filter: &FilterParam,
        start: usize,
    ) -> Result<Predicate, SearchError> {
        match filter.kind {
            FilterKind::Field => self.compile_field(resource_type, filter, start),
            FilterKind::Chain => {
                let hops = self
                    .chains
                    .resolve(&self.params, resource_type, &filter.name)?;
                Ok(multi_level_chained_search_clause(&hops, &filter.value, start)?)
            }
            FilterKind::ReverseChain => {
                let path = parse_has(&filter.name)?;
                let config = resolve_has(&path, &self.params)?;
                Ok(reverse_chain_clause(ID_COLUMN, &config, &filter.value, start)?)
            }
        }
    }

    fn compile_field(
        &self,
        resource_type: &str,
        filter: &FilterParam,
        start: usize,
    ) -> Result<Predicate, SearchError> {
        let (name, suffix) = split_modifier(&filter.name);
        let config = self
            .params
            .get(resource_type, name)
            .ok_or_else(|| SearchError::UnknownParameter {
                resource_type: resource_type.to_string(),
                param: name.to_string(),
            })?;
        validate_identifier(&config.column)?;
        if let Some(system) = &config.system_column {
            validate_identifier(system)?;
        }

        if let Some(suffix) = suffix {
            match compile_modified_parameter(&filter.name, &filter.value, &config, start)? {
                Some(predicate) => return Ok(predicate),
                None => tracing::debug!(
                    param = name,
                    modifier = suffix,
                    "unrecognized modifier, matching unmodified"
                ),
            }
        }

        Ok(leaf_predicate_any(
            &LeafColumn::from(config.as_ref()),
            &filter.value,
            start,
        ))
    }

    /// Resolve `_sort` into sort keys; `-_lastUpdated` when absent or empty.
    pub fn sort_keys(
        &self,
        resource_type: &str,
        raw: Option<&str>,
    ) -> Result<Vec<SortKey>, SearchError> {
        let mut keys = Vec::new();
        for item in raw.unwrap_or_default().split(',').map(str::trim) {
            if item.is_empty() {
                continue;
            }
            let (field, ascending) = match item.strip_prefix('-') {
                Some(field) => (field, false),
                None => (item, true),
            };
            let config = self.params.get(resource_type, field).ok_or_else(|| {
                SearchError::UnknownSortField {
                    resource_type: resource_type.to_string(),
                    field: field.to_string(),
                }
            })?;
            let key = SortKey::new(field, config.column.clone(), ascending).with_kind(config.kind);
            keys.push(if NOT_NULL_SORT_FIELDS.contains(&field) {
                key
            } else {
                key.nullable()
            });
        }

        if keys.is_empty() {
            keys.push(SortKey::last_updated());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaining::ChainingError;
    use crate::common::register_common_parameters;
    use crate::cursor::{CursorDirection, PageCursor};
    use crate::parameters::{SearchParamConfig, SearchParameterType};
    use crate::sql_builder::SqlParam;
    use crate::terminology::{InMemoryValueSets, ValueSetConcept};
    use indexmap::IndexMap;
    use serde_json::json;

    fn registry() -> SearchParameterRegistry {
        let registry = SearchParameterRegistry::new();
        register_common_parameters(&registry);
        registry.register(
            "Patient",
            SearchParamConfig::new("family", "family", SearchParameterType::String),
        );
        registry.register(
            "Patient",
            SearchParamConfig::new("birthdate", "birth_date", SearchParameterType::Date),
        );
        registry.register(
            "Patient",
            SearchParamConfig::new("gender", "gender", SearchParameterType::Token),
        );
        registry.register(
            "Observation",
            SearchParamConfig::new("code", "code", SearchParameterType::Token)
                .with_system_column("code_system"),
        );
        registry.register(
            "Observation",
            SearchParamConfig::new("subject", "subject_id", SearchParameterType::Reference)
                .with_target_type("Patient"),
        );
        registry.register(
            "Observation",
            SearchParamConfig::new("status", "status", SearchParameterType::Token),
        );
        registry.register(
            "Observation",
            SearchParamConfig::new("value-quantity", "value_quantity", SearchParameterType::Number),
        );
        registry
    }

    fn compiler() -> SearchCompiler {
        SearchCompiler::new(
            Arc::new(registry()),
            Arc::new(ChainRegistry::new()),
            PaginationConfig::default().with_secret("engine-test"),
        )
        .unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let err = SearchCompiler::new(
            Arc::new(registry()),
            Arc::new(ChainRegistry::new()),
            PaginationConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SearchError::Config(_)));
        assert!(err.is_server_error());
    }

    #[test]
    fn test_first_page() {
        let compiled = compiler().compile("Patient", "family=smi&_count=2").unwrap();
        assert_eq!(
            compiled.query.sql,
            "SELECT id, fhir_id, version_id, last_updated, resource FROM patients \
             WHERE family ILIKE $1 \
             ORDER BY last_updated DESC NULLS LAST, id DESC NULLS LAST LIMIT 3"
        );
        assert_eq!(compiled.query.params, vec![SqlParam::text("smi%")]);
        assert_eq!(compiled.page.count, 2);
    }

    #[test]
    fn test_filters_share_one_index_sequence() {
        let compiled = compiler()
            .compile(
                "Observation",
                "subject.family=smith&code=http://loinc.org|1234-5,http://loinc.org|999\
                 &status:not=cancelled&value-quantity=gt5.4",
            )
            .unwrap();
        let sql = &compiled.query.sql;
        assert!(sql.starts_with(
            "SELECT id, fhir_id, version_id, last_updated, resource FROM observations WHERE "
        ));
        assert!(sql.contains("(subject_id IN (SELECT id FROM patients WHERE family ILIKE $1))"));
        assert!(sql.contains(
            "((code_system = $2 AND code = $3) OR (code_system = $4 AND code = $5))"
        ));
        assert!(sql.contains("(NOT (status = $6))"));
        assert!(sql.contains("(value_quantity > $7)"));
        assert!(sql.ends_with("LIMIT 11"));
        assert_eq!(compiled.query.params.len(), 7);
        assert_eq!(compiled.query.params[6], SqlParam::Float(5.4));
    }

    #[test]
    fn test_reverse_chain() {
        let compiled = compiler()
            .compile("Patient", "_has:Observation:subject:code=1234-5")
            .unwrap();
        assert!(compiled.query.sql.contains(
            "WHERE id IN (SELECT subject_id FROM observations WHERE code = $1)"
        ));
    }

    #[test]
    fn test_chain_reference_leaf_matches_plain_field() {
        let params = registry();
        params.register(
            "Patient",
            SearchParamConfig::new("organization", "organization_id", SearchParameterType::Reference)
                .with_target_type("Organization"),
        );
        let compiler = SearchCompiler::new(
            Arc::new(params),
            Arc::new(ChainRegistry::new()),
            PaginationConfig::default().with_secret("engine-test"),
        )
        .unwrap();

        let plain = compiler.compile("Patient", "organization=acme").unwrap();
        assert!(plain.query.sql.contains(
            "WHERE organization_id = (SELECT id FROM organizations WHERE fhir_id = $1)"
        ));

        let chained = compiler
            .compile("Observation", "subject.organization=acme")
            .unwrap();
        assert!(chained.query.sql.contains(
            "subject_id IN (SELECT id FROM patients WHERE organization_id = \
             (SELECT id FROM organizations WHERE fhir_id = $1))"
        ));
        assert_eq!(chained.query.params, vec![SqlParam::text("acme")]);
        assert_eq!(plain.query.params, chained.query.params);
    }

    #[test]
    fn test_sort_adds_column_and_nullable_key() {
        let compiled = compiler().compile("Patient", "_sort=birthdate").unwrap();
        assert_eq!(
            compiled.query.sql,
            "SELECT id, fhir_id, version_id, last_updated, resource, birth_date FROM patients \
             ORDER BY birth_date ASC NULLS LAST, id DESC NULLS LAST LIMIT 11"
        );
        assert!(compiled.page.sort[0].nullable);
        assert_eq!(compiled.page.sort_param(), "birthdate");
    }

    #[test]
    fn test_sort_keys() {
        let keys = compiler()
            .sort_keys("Patient", Some("-_lastUpdated, family"))
            .unwrap();
        assert_eq!(keys[0], SortKey::last_updated());
        assert_eq!(
            keys[1],
            SortKey::asc("family", "family")
                .nullable()
                .with_kind(SearchParameterType::String)
        );

        let keys = compiler().sort_keys("Patient", Some("")).unwrap();
        assert_eq!(keys, vec![SortKey::last_updated()]);
    }

    #[test]
    fn test_keyset_after_filters() {
        let compiler = compiler();
        let cursor = PageCursor::new(
            IndexMap::from([("last_updated".to_string(), json!("2024-05-01T10:00:00Z"))]),
            json!("5b0d1c8e-0000-4000-8000-000000000001"),
            CursorDirection::Forward,
            vec![SortKey::last_updated()],
            2,
        );
        let token = compiler.paginator().codec().unwrap().encode(&cursor).unwrap();
        let compiled = compiler
            .compile("Patient", &format!("gender=female&_cursor={token}"))
            .unwrap();
        assert_eq!(
            compiled.query.sql,
            "SELECT id, fhir_id, version_id, last_updated, resource FROM patients \
             WHERE (gender = $1) AND ((last_updated < $2) OR (last_updated = $2 AND id < $3)) \
             ORDER BY last_updated DESC NULLS LAST, id DESC NULLS LAST LIMIT 3"
        );
        assert_eq!(
            compiled.query.params,
            vec![
                SqlParam::text("female"),
                SqlParam::Timestamp("2024-05-01T10:00:00Z".to_string()),
                SqlParam::text("5b0d1c8e-0000-4000-8000-000000000001"),
            ]
        );
    }

    #[test]
    fn test_unknown_inputs_are_client_errors() {
        let compiler = compiler();
        let cases = [
            ("Patient", "nickname=bob"),
            ("Patient", "_sort=nickname"),
            ("patient", "family=smith"),
            ("Patient", "_cursor=a&_cursor:prev=b"),
            ("Patient", "_count=many"),
        ];
        for (resource_type, query) in cases {
            let err = compiler.compile(resource_type, query).unwrap_err();
            assert!(err.is_client_error(), "{query}: {err}");
        }
    }

    #[test]
    fn test_unrecognized_modifier_matches_unmodified() {
        let compiled = compiler().compile("Patient", "family:text=smith").unwrap();
        assert_eq!(
            compiled.query.sql,
            "SELECT id, fhir_id, version_id, last_updated, resource FROM patients \
             WHERE family ILIKE $1 \
             ORDER BY last_updated DESC NULLS LAST, id DESC NULLS LAST LIMIT 11"
        );
        assert_eq!(compiled.query.params, vec![SqlParam::text("smith%")]);
    }

    #[test]
    fn test_modifier_not_applicable() {
        let err = compiler()
            .compile("Patient", "birthdate:exact=2020")
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("exact"));
    }

    #[test]
    fn test_chain_depth_exceeded() {
        let err = compiler()
            .compile("Observation", "subject.a.b.c.d=x")
            .unwrap_err();
        assert!(matches!(
            err,
            SearchError::Chaining(ChainingError::DepthExceeded { depth: 4, max: 3 })
        ));
    }

    #[test]
    fn test_compile_expanded() {
        let sets = InMemoryValueSets::new();
        sets.insert(
            "http://example.org/vs/status",
            vec![
                ValueSetConcept::new("http://hl7.org/fhir/observation-status", "final"),
                ValueSetConcept::new("http://hl7.org/fhir/observation-status", "amended"),
            ],
        );
        let compiled = tokio_test::block_on(compiler().compile_expanded(
            "Observation",
            "status:in=http://example.org/vs/status",
            &sets,
        ))
        .unwrap();
        assert!(compiled.query.sql.contains("WHERE status = ANY($1)"));
        assert_eq!(
            compiled.query.params,
            vec![SqlParam::TextArray(vec![
                "final".to_string(),
                "amended".to_string()
            ])]
        );
    }
}
