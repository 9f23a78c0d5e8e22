//! Search modifier predicate compiler.
//!
//! Turns one `name:modifier=value` pair into a [`Predicate`] numbered from a
//! caller-supplied start index. Suffixes are resolved to a [`SearchModifier`]
//! once, in a fixed order:
//!
//! 1. `:missing` (anything after it is ignored);
//! 2. a typed-reference suffix (`:Patient`);
//! 3. the generic modifier table.
//!
//! Returning `Ok(None)` means the name carried no recognized modifier and the
//! caller should fall back to unmodified matching.
//!
//! `:above` / `:below` are a prefix-match approximation of code hierarchy:
//! both emit `code LIKE value || '%'` and no subsumption is computed.

use crate::parameters::{SearchModifier, SearchParamConfig, SearchParameterType, split_modifier};
use crate::sql_builder::{Predicate, SqlBuilderError, SqlParam};
use crate::types::token::{parse_token_value, token_equality};
use crate::types::{any_value, contains_predicate, exact_predicate, split_reference};

/// Resolve a raw modifier suffix using the dispatch order above.
pub fn resolve_modifier(suffix: &str) -> Option<SearchModifier> {
    let head = suffix.split(':').next().unwrap_or(suffix);
    if head == "missing" {
        return Some(SearchModifier::Missing);
    }
    if head.starts_with(|c: char| c.is_ascii_uppercase()) {
        return Some(SearchModifier::Type(head.to_string()));
    }
    SearchModifier::parse(head)
}

/// Compile a parameter carrying a modifier suffix.
///
/// Errors when the modifier does not apply to the parameter's kind, or when
/// `:above`/`:below` is used on a token without a system column.
pub fn compile_modified_parameter(
    raw_name: &str,
    value: &str,
    config: &SearchParamConfig,
    start: usize,
) -> Result<Option<Predicate>, SqlBuilderError> {
    let (name, suffix) = split_modifier(raw_name);
    let Some(modifier) = suffix.and_then(resolve_modifier) else {
        return Ok(None);
    };

    if !modifier.applicable_to(config.kind) {
        return Err(invalid_modifier(name, &modifier, config.kind));
    }

    let predicate = compile_modifier(name, &modifier, value, config, start)?;
    tracing::debug!(
        param = name,
        modifier = %modifier,
        sql = %predicate.sql,
        args = predicate.arg_count(),
        "compiled modified search parameter"
    );
    Ok(Some(predicate))
}

/// Compile an already resolved modifier.
pub fn compile_modifier(
    name: &str,
    modifier: &SearchModifier,
    value: &str,
    config: &SearchParamConfig,
    start: usize,
) -> Result<Predicate, SqlBuilderError> {
    let column = config.column.as_str();

    let predicate = match modifier {
        SearchModifier::Missing => missing_predicate(column, value),
        SearchModifier::Type(resource_type) => {
            let type_column = config.type_column();
            any_value(value, start, |v, idx| {
                typed_reference_predicate(column, &type_column, resource_type, v, idx)
            })
        }
        SearchModifier::Not => not_predicate(column, config.system_column.as_deref(), value, start),
        SearchModifier::Above | SearchModifier::Below => {
            let Some(system_column) = config.system_column.as_deref() else {
                return Err(invalid_modifier(name, modifier, config.kind));
            };
            any_value(value, start, |v, idx| {
                hierarchy_predicate(column, system_column, v, idx)
            })
        }
        SearchModifier::OfType => {
            let system_column = config
                .system_column
                .clone()
                .unwrap_or_else(|| format!("{column}_system"));
            let type_column = config.type_column();
            any_value(value, start, |v, idx| {
                of_type_predicate(column, &system_column, &type_column, v, idx)
            })
        }
        SearchModifier::In => any_value(value, start, |v, idx| value_set_predicate(column, v, idx)),
        SearchModifier::NotIn => {
            any_value(value, start, |v, idx| value_set_predicate(column, v, idx)).negate()
        }
        SearchModifier::Exact => any_value(value, start, |v, idx| exact_predicate(column, v, idx)),
        SearchModifier::Contains => {
            any_value(value, start, |v, idx| contains_predicate(column, v, idx))
        }
    };

    Ok(predicate)
}

fn invalid_modifier(
    name: &str,
    modifier: &SearchModifier,
    kind: SearchParameterType,
) -> SqlBuilderError {
    SqlBuilderError::InvalidModifier {
        param: name.to_string(),
        modifier: modifier.to_string(),
        kind: kind.to_string(),
    }
}

/// `:missing=true|false`. Any other value never matches.
fn missing_predicate(column: &str, value: &str) -> Predicate {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Predicate::bare(format!("{column} IS NULL")),
        "false" => Predicate::bare(format!("{column} IS NOT NULL")),
        _ => Predicate::always_false(),
    }
}

fn typed_reference_predicate(
    column: &str,
    type_column: &str,
    resource_type: &str,
    value: &str,
    start: usize,
) -> Predicate {
    let (_, id) = split_reference(value);
    if id.is_empty() {
        return Predicate::always_false();
    }
    Predicate::new(
        format!("({column} = ${start} AND {type_column} = ${})", start + 1),
        vec![SqlParam::text(id), SqlParam::text(resource_type)],
    )
}

/// `:not` negates the equality on whichever halves of each value are present.
/// Several values exclude all of them.
fn not_predicate(
    column: &str,
    system_column: Option<&str>,
    value: &str,
    start: usize,
) -> Predicate {
    let mut next = start;
    let mut matches = Vec::new();
    for v in value.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let Some(eq) = token_equality(column, system_column, v, next) else {
            return Predicate::always_false();
        };
        next += eq.arg_count();
        matches.push(eq);
    }
    if matches.is_empty() {
        return Predicate::always_false();
    }
    Predicate::any(matches).negate()
}

fn hierarchy_predicate(column: &str, system_column: &str, value: &str, start: usize) -> Predicate {
    let token = parse_token_value(value);
    match (token.system, token.code) {
        (Some(system), Some(code)) => Predicate::new(
            format!(
                "({system_column} = ${start} AND {column} LIKE ${} || '%')",
                start + 1
            ),
            vec![SqlParam::text(system), SqlParam::text(code)],
        ),
        (None, Some(code)) => Predicate::new(
            format!("{column} LIKE ${start} || '%'"),
            vec![SqlParam::text(code)],
        ),
        (Some(system), None) => Predicate::new(
            format!("{system_column} = ${start}"),
            vec![SqlParam::text(system)],
        ),
        (None, None) => Predicate::always_false(),
    }
}

/// `:of-type` takes `system|type|value`; any other shape never matches.
fn of_type_predicate(
    column: &str,
    system_column: &str,
    type_column: &str,
    value: &str,
    start: usize,
) -> Predicate {
    let parts: Vec<&str> = value.split('|').collect();
    let [system, type_code, code] = parts.as_slice() else {
        return Predicate::always_false();
    };
    if system.is_empty() || type_code.is_empty() || code.is_empty() {
        return Predicate::always_false();
    }
    Predicate::new(
        format!(
            "({system_column} = ${start} AND {type_column} = ${} AND {column} = ${})",
            start + 1,
            start + 2
        ),
        vec![
            SqlParam::text(*system),
            SqlParam::text(*type_code),
            SqlParam::text(*code),
        ],
    )
}

fn value_set_predicate(column: &str, url: &str, start: usize) -> Predicate {
    Predicate::new(
        format!("{column} = ANY(${start})"),
        vec![SqlParam::ValueSetUrl(url.to_string())],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_config() -> SearchParamConfig {
        SearchParamConfig::new("code", "code", SearchParameterType::Token)
            .with_system_column("code_system")
    }

    fn compile(raw: &str, value: &str, config: &SearchParamConfig, start: usize) -> Predicate {
        compile_modified_parameter(raw, value, config, start)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_missing_true() {
        let cfg = SearchParamConfig::new("deceased", "deceased_date", SearchParameterType::Date);
        let pred = compile("deceased:missing", "true", &cfg, 1);
        assert_eq!(pred.sql, "deceased_date IS NULL");
        assert!(pred.params.is_empty());
    }

    #[test]
    fn test_missing_false() {
        let cfg = SearchParamConfig::new("deceased", "deceased_date", SearchParameterType::Date);
        let pred = compile("deceased:missing", "false", &cfg, 1);
        assert_eq!(pred.sql, "deceased_date IS NOT NULL");
    }

    #[test]
    fn test_missing_bad_value_matches_nothing() {
        let cfg = SearchParamConfig::new("deceased", "deceased_date", SearchParameterType::Date);
        assert!(compile("deceased:missing", "maybe", &cfg, 1).is_always_false());
    }

    #[test]
    fn test_missing_wins_over_trailing_suffix() {
        let pred = compile("code:missing:not", "true", &token_config(), 1);
        assert_eq!(pred.sql, "code IS NULL");
    }

    #[test]
    fn test_missing_is_not_split_on_commas() {
        let cfg = SearchParamConfig::new("deceased", "deceased_date", SearchParameterType::Date);
        assert!(compile("deceased:missing", "true,false", &cfg, 1).is_always_false());
    }

    #[test]
    fn test_unmodified_name_is_not_recognized() {
        let result = compile_modified_parameter("code", "x", &token_config(), 1).unwrap();
        assert!(result.is_none());
        let result = compile_modified_parameter("code:text", "x", &token_config(), 1).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_typed_reference() {
        let cfg = SearchParamConfig::new("subject", "subject", SearchParameterType::Reference);
        let pred = compile("subject:Patient", "Patient/123", &cfg, 3);
        assert_eq!(pred.sql, "(subject = $3 AND subject_type = $4)");
        assert_eq!(
            pred.params,
            vec![SqlParam::text("123"), SqlParam::text("Patient")]
        );
    }

    #[test]
    fn test_typed_reference_on_token_is_rejected() {
        let err = compile_modified_parameter("code:Patient", "123", &token_config(), 1).unwrap_err();
        assert!(matches!(err, SqlBuilderError::InvalidModifier { .. }));
    }

    #[test]
    fn test_not_variants() {
        let cfg = token_config();

        let pred = compile("code:not", "http://loinc.org|1234-5", &cfg, 1);
        assert_eq!(pred.sql, "NOT (code_system = $1 AND code = $2)");
        assert_eq!(pred.arg_count(), 2);

        let pred = compile("code:not", "http://loinc.org|", &cfg, 1);
        assert_eq!(pred.sql, "NOT (code_system = $1)");

        let pred = compile("code:not", "|1234-5", &cfg, 1);
        assert_eq!(pred.sql, "NOT (code = $1)");

        let pred = compile("code:not", "1234-5", &cfg, 7);
        assert_eq!(pred.sql, "NOT (code = $7)");
        assert_eq!(pred.params, vec![SqlParam::text("1234-5")]);
    }

    #[test]
    fn test_not_multiple_values_excludes_all() {
        let pred = compile("code:not", "a,b", &token_config(), 1);
        assert_eq!(pred.sql, "NOT ((code = $1) OR (code = $2))");
    }

    #[test]
    fn test_not_on_string_is_rejected() {
        let cfg = SearchParamConfig::new("name", "last_name", SearchParameterType::String);
        assert!(compile_modified_parameter("name:not", "x", &cfg, 1).is_err());
    }

    #[test]
    fn test_above_and_below_use_prefix_match() {
        let cfg = token_config();
        let above = compile("code:above", "http://snomed.info/sct|1234", &cfg, 1);
        let below = compile("code:below", "http://snomed.info/sct|1234", &cfg, 1);
        assert_eq!(above.sql, "(code_system = $1 AND code LIKE $2 || '%')");
        assert_eq!(above.sql, below.sql);

        let pred = compile("code:below", "1234", &cfg, 4);
        assert_eq!(pred.sql, "code LIKE $4 || '%'");
        assert_eq!(pred.params, vec![SqlParam::text("1234")]);
    }

    #[test]
    fn test_above_requires_system_column() {
        let cfg = SearchParamConfig::new("status", "status", SearchParameterType::Token);
        let err = compile_modified_parameter("status:above", "final", &cfg, 1).unwrap_err();
        assert!(matches!(err, SqlBuilderError::InvalidModifier { .. }));
    }

    #[test]
    fn test_of_type() {
        let cfg = SearchParamConfig::new("identifier", "identifier", SearchParameterType::Token)
            .with_system_column("identifier_system");
        let pred = compile("identifier:of-type", "http://loinc.org|obs-type|1234-5", &cfg, 1);
        assert_eq!(
            pred.sql,
            "(identifier_system = $1 AND identifier_type = $2 AND identifier = $3)"
        );
        assert_eq!(
            pred.params,
            vec![
                SqlParam::text("http://loinc.org"),
                SqlParam::text("obs-type"),
                SqlParam::text("1234-5"),
            ]
        );
    }

    #[test]
    fn test_of_type_malformed_matches_nothing() {
        let cfg = token_config();
        let pred = compile("code:of-type", "bad", &cfg, 1);
        assert_eq!(pred.sql, "1=0");
        assert!(pred.params.is_empty());
        assert!(compile("code:of-type", "a|b", &cfg, 1).is_always_false());
        assert!(compile("code:of-type", "a||c", &cfg, 1).is_always_false());
    }

    #[test]
    fn test_in_and_not_in() {
        let cfg = token_config();
        let url = "http://hl7.org/fhir/ValueSet/observation-codes";

        let pred = compile("code:in", url, &cfg, 2);
        assert_eq!(pred.sql, "code = ANY($2)");
        assert_eq!(pred.params, vec![SqlParam::ValueSetUrl(url.into())]);

        let pred = compile("code:not-in", url, &cfg, 1);
        assert_eq!(pred.sql, "NOT (code = ANY($1))");
    }

    #[test]
    fn test_string_exact_and_contains() {
        let cfg = SearchParamConfig::new("family", "last_name", SearchParameterType::String);
        assert_eq!(compile("family:exact", "Smith", &cfg, 1).sql, "last_name = $1");
        let pred = compile("family:contains", "mit", &cfg, 1);
        assert_eq!(pred.sql, "last_name ILIKE $1");
        assert_eq!(pred.params, vec![SqlParam::text("%mit%")]);
    }

    #[test]
    fn test_resolve_modifier_order() {
        assert_eq!(resolve_modifier("missing:Patient"), Some(SearchModifier::Missing));
        assert_eq!(
            resolve_modifier("Patient:not"),
            Some(SearchModifier::Type("Patient".into()))
        );
        assert_eq!(resolve_modifier("not:missing"), Some(SearchModifier::Not));
        assert_eq!(resolve_modifier("identifier"), None);
    }
}
