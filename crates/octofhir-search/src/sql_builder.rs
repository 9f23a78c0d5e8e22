//! Positional SQL builder for FHIR search queries.
//!
//! Every search request owns exactly one [`QueryBuilder`]. Compilers that
//! produce WHERE fragments (modifiers, chains, keyset pagination) follow a
//! two-step protocol against it:
//!
//! 1. call [`QueryBuilder::idx`] to learn the next free placeholder number;
//! 2. render their fragment with `$idx`, `$idx + 1`, ... and commit it with
//!    [`QueryBuilder::add`] (or [`QueryBuilder::push`]) before anyone else
//!    asks for an index.
//!
//! User input only ever travels through [`SqlParam`] bind values. Identifiers
//! that end up in SQL text (tables, columns) come from registries and are
//! validated with [`validate_identifier`].

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Errors that can occur during SQL building.
#[derive(Debug, Error)]
pub enum SqlBuilderError {
    #[error("Invalid modifier '{modifier}' for {kind} parameter '{param}'")]
    InvalidModifier {
        param: String,
        modifier: String,
        kind: String,
    },

    #[error("Invalid search value: {0}")]
    InvalidSearchValue(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Query too complex: {0}")]
    QueryTooComplex(String),
}

/// Predicate text that never matches. Used for value-shape errors so a bad
/// client value produces an empty result instead of a failed request.
pub const ALWAYS_FALSE: &str = "1=0";

/// Maximum number of WHERE fragments allowed in one query.
const MAX_CONDITIONS: usize = 100;

/// Validate an identifier (table name, column name).
///
/// Allows ASCII alphanumerics, underscores and dots (for qualified names);
/// the first character must not be a digit.
pub fn validate_identifier(name: &str) -> Result<(), SqlBuilderError> {
    let Some(first) = name.chars().next() else {
        return Err(SqlBuilderError::InvalidIdentifier(
            "Empty identifier".to_string(),
        ));
    };

    if first.is_ascii_digit()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(SqlBuilderError::InvalidIdentifier(name.to_string()));
    }

    Ok(())
}

/// Map a FHIR resource type to its storage table.
///
/// `Patient` → `patients`, `MedicationRequest` → `medication_requests`,
/// `Library` → `libraries`.
pub fn resource_table(resource_type: &str) -> String {
    let mut snake = String::with_capacity(resource_type.len() + 4);
    for (i, c) in resource_type.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                snake.push('_');
            }
            snake.push(c.to_ascii_lowercase());
        } else {
            snake.push(c);
        }
    }

    if let Some(stem) = snake.strip_suffix('y')
        && !stem.ends_with(['a', 'e', 'i', 'o', 'u'])
    {
        return format!("{stem}ies");
    }
    if snake.ends_with('s') || snake.ends_with('x') || snake.ends_with("ch") || snake.ends_with("sh")
    {
        return format!("{snake}es");
    }
    snake.push('s');
    snake
}

/// Collect the distinct `$N` placeholder numbers referenced by a SQL fragment.
pub fn placeholders(sql: &str) -> BTreeSet<usize> {
    let bytes = sql.as_bytes();
    let mut found = BTreeSet::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start
                && let Ok(n) = sql[start..end].parse::<usize>()
            {
                found.insert(n);
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    found
}

// ============================================================================
// Bind values and predicates
// ============================================================================

/// Wrap `sql` in parentheses unless one pair already encloses all of it.
pub(crate) fn parenthesize(sql: &str) -> String {
    if is_enclosed(sql) {
        sql.to_string()
    } else {
        format!("({sql})")
    }
}

fn is_enclosed(sql: &str) -> bool {
    if !sql.starts_with('(') || !sql.ends_with(')') {
        return false;
    }
    let mut depth = 0usize;
    for (i, c) in sql.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i == sql.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// A positional bind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(String),
    TextArray(Vec<String>),
    /// Canonical URL of a ValueSet bound by `:in` / `:not-in`. The caller
    /// replaces it with the expanded code list before execution.
    ValueSetUrl(String),
}

impl SqlParam {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Get the value as a string for display/debugging.
    pub fn as_display_str(&self) -> String {
        match self {
            Self::Text(s) | Self::Timestamp(s) | Self::ValueSetUrl(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::TextArray(values) => format!("{{{}}}", values.join(",")),
        }
    }
}

/// A compiled WHERE fragment together with the values it binds.
///
/// The placeholders in `sql` are numbered from the index the fragment was
/// built at; `params[k]` binds placeholder `start + k`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl Predicate {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A predicate without bind values.
    pub fn bare(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    pub fn always_false() -> Self {
        Self::bare(ALWAYS_FALSE)
    }

    pub fn is_always_false(&self) -> bool {
        self.sql == ALWAYS_FALSE
    }

    /// Number of placeholder slots this predicate consumes.
    pub fn arg_count(&self) -> usize {
        self.params.len()
    }

    /// Combine predicates built back to back (each starting where the previous
    /// one ended) with OR.
    pub fn any(mut parts: Vec<Predicate>) -> Predicate {
        match parts.len() {
            0 => Predicate::always_false(),
            1 => parts.remove(0),
            _ => {
                let mut params = Vec::new();
                let mut sqls = Vec::with_capacity(parts.len());
                for part in parts {
                    sqls.push(parenthesize(&part.sql));
                    params.extend(part.params);
                }
                Predicate::new(sqls.join(" OR "), params)
            }
        }
    }

    /// Wrap the predicate in `NOT (...)`.
    pub fn negate(self) -> Predicate {
        Predicate::new(format!("NOT {}", parenthesize(&self.sql)), self.params)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

// ============================================================================
// Query builder
// ============================================================================

/// Accumulates WHERE fragments and bind values for one search request.
///
/// Invariant: the distinct `$N` placeholders across all fragments are exactly
/// `1..=params.len()`; numbers are handed out in increasing order and never
/// reused.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    columns: Vec<String>,
    conditions: Vec<String>,
    params: Vec<SqlParam>,
    order_by: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl QueryBuilder {
    /// Create a builder selecting `*` from `table`.
    pub fn new(table: impl Into<String>) -> Result<Self, SqlBuilderError> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            table,
            columns: Vec::new(),
            conditions: Vec::new(),
            params: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
        })
    }

    /// Set the selected column list.
    pub fn with_columns<I, S>(mut self, columns: I) -> Result<Self, SqlBuilderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        for column in &columns {
            validate_identifier(column)?;
        }
        self.columns = columns;
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The next unused placeholder index. Does not mutate the builder.
    pub fn idx(&self) -> usize {
        self.params.len() + 1
    }

    /// Append a fragment (ANDed with the existing ones) and its bind values.
    ///
    /// `predicate` must number its placeholders from [`Self::idx`].
    pub fn add(&mut self, predicate: impl Into<String>, values: Vec<SqlParam>) {
        let predicate = predicate.into();
        debug_assert!(
            placeholders(&predicate)
                .iter()
                .all(|&n| n >= self.idx() && n < self.idx() + values.len()),
            "fragment placeholders must start at the builder index: {predicate}"
        );
        self.conditions.push(predicate);
        self.params.extend(values);
    }

    /// Commit a compiled [`Predicate`].
    pub fn push(&mut self, predicate: Predicate) {
        self.add(predicate.sql, predicate.params);
    }

    pub fn order_by(&mut self, clause: impl Into<String>) {
        self.order_by = Some(clause.into());
    }

    pub fn limit(&mut self, limit: usize) {
        self.limit = Some(limit);
    }

    pub fn offset(&mut self, offset: usize) {
        self.offset = Some(offset);
    }

    /// Get the current parameter count.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Get all parameters.
    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    /// Get all conditions.
    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    /// Build the WHERE clause by joining conditions with AND.
    ///
    /// Returns `None` if there are no conditions. With several conditions each
    /// one is parenthesized so OR-chains keep their grouping.
    pub fn where_clause(&self) -> Option<String> {
        match self.conditions.as_slice() {
            [] => None,
            [single] => Some(single.clone()),
            many => Some(
                many.iter()
                    .map(|c| parenthesize(c))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            ),
        }
    }

    /// Render the final statement. Side-effect free and repeatable.
    pub fn build(&self) -> Result<BuiltQuery, SqlBuilderError> {
        if self.conditions.len() > MAX_CONDITIONS {
            return Err(SqlBuilderError::QueryTooComplex(format!(
                "Too many conditions: {} (max {})",
                self.conditions.len(),
                MAX_CONDITIONS
            )));
        }

        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };

        let mut sql = format!("SELECT {columns} FROM {}", self.table);

        if let Some(where_sql) = self.where_clause() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }

        if let Some(order) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = self.offset.filter(|o| *o > 0) {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        Ok(BuiltQuery {
            sql,
            params: self.params.clone(),
        })
    }
}

/// A built SQL query with parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl fmt::Display for BuiltQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idx_advances_by_argument_count() {
        let mut builder = QueryBuilder::new("patients").unwrap();
        assert_eq!(builder.idx(), 1);

        builder.add("last_name ILIKE $1", vec![SqlParam::text("Smith%")]);
        assert_eq!(builder.idx(), 2);

        let start = builder.idx();
        builder.add(
            format!("(system = ${start} AND code = ${})", start + 1),
            vec![SqlParam::text("http://loinc.org"), SqlParam::text("1234-5")],
        );
        assert_eq!(builder.idx(), start + 2);

        builder.add("deceased_date IS NULL", vec![]);
        assert_eq!(builder.idx(), 4);
    }

    #[test]
    fn test_idx_does_not_mutate() {
        let builder = QueryBuilder::new("patients").unwrap();
        assert_eq!(builder.idx(), 1);
        assert_eq!(builder.idx(), 1);
        assert_eq!(builder.param_count(), 0);
    }

    #[test]
    fn test_placeholder_count_matches_params() {
        let mut builder = QueryBuilder::new("observations").unwrap();
        builder.add("status = $1", vec![SqlParam::text("final")]);
        builder.add(
            "(last_updated < $2) OR (last_updated = $2 AND id < $3)",
            vec![
                SqlParam::Timestamp("2024-01-01T00:00:00Z".into()),
                SqlParam::text("abc"),
            ],
        );

        let clause = builder.where_clause().unwrap();
        let found = placeholders(&clause);
        assert_eq!(found.len(), builder.params().len());
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_where_clause_single_is_unwrapped() {
        let mut builder = QueryBuilder::new("patients").unwrap();
        builder.add("deceased_date IS NULL", vec![]);
        assert_eq!(builder.where_clause().unwrap(), "deceased_date IS NULL");
    }

    #[test]
    fn test_where_clause_groups_disjunctions() {
        let mut builder = QueryBuilder::new("patients").unwrap();
        builder.add("gender = $1", vec![SqlParam::text("female")]);
        builder.add("(a < $2) OR (a = $2 AND id < $3)", vec![
            SqlParam::Integer(1),
            SqlParam::text("x"),
        ]);
        assert_eq!(
            builder.where_clause().unwrap(),
            "(gender = $1) AND ((a < $2) OR (a = $2 AND id < $3))"
        );
    }

    #[test]
    fn test_where_clause_empty() {
        let builder = QueryBuilder::new("patients").unwrap();
        assert!(builder.where_clause().is_none());
    }

    #[test]
    fn test_build_is_repeatable() {
        let mut builder = QueryBuilder::new("patients")
            .unwrap()
            .with_columns(["id", "resource"])
            .unwrap();
        builder.add("gender = $1", vec![SqlParam::text("male")]);
        builder.order_by("last_updated DESC NULLS LAST, id DESC NULLS LAST");
        builder.limit(11);

        let first = builder.build().unwrap();
        let second = builder.build().unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.sql,
            "SELECT id, resource FROM patients WHERE gender = $1 \
             ORDER BY last_updated DESC NULLS LAST, id DESC NULLS LAST LIMIT 11"
        );
        assert_eq!(first.params, vec![SqlParam::text("male")]);
    }

    #[test]
    fn test_build_with_offset() {
        let mut builder = QueryBuilder::new("patients").unwrap();
        builder.limit(11);
        builder.offset(20);
        let query = builder.build().unwrap();
        assert!(query.sql.ends_with("LIMIT 11 OFFSET 20"));
        assert!(query.sql.starts_with("SELECT * FROM patients"));
    }

    #[test]
    fn test_build_too_many_conditions() {
        let mut builder = QueryBuilder::new("patients").unwrap();
        for _ in 0..101 {
            builder.add("active", vec![]);
        }
        assert!(matches!(
            builder.build(),
            Err(SqlBuilderError::QueryTooComplex(_))
        ));
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        assert!(QueryBuilder::new("patients; DROP TABLE x").is_err());
        assert!(QueryBuilder::new("").is_err());
        assert!(QueryBuilder::new("1patients").is_err());
        assert!(
            QueryBuilder::new("patients")
                .unwrap()
                .with_columns(["id", "name--"])
                .is_err()
        );
        assert!(validate_identifier("public.patients").is_ok());
    }

    #[test]
    fn test_resource_table() {
        assert_eq!(resource_table("Patient"), "patients");
        assert_eq!(resource_table("Observation"), "observations");
        assert_eq!(resource_table("MedicationRequest"), "medication_requests");
        assert_eq!(resource_table("Library"), "libraries");
        assert_eq!(resource_table("Survey"), "surveys");
        assert_eq!(resource_table("Basic"), "basics");
        assert_eq!(resource_table("Group"), "groups");
    }

    #[test]
    fn test_placeholders_parsing() {
        let found = placeholders("a = $1 AND b = $12 AND c = $1 AND d = '$'");
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![1, 12]);
    }

    #[test]
    fn test_predicate_any() {
        let combined = Predicate::any(vec![
            Predicate::new("code = $1", vec![SqlParam::text("a")]),
            Predicate::new("code = $2", vec![SqlParam::text("b")]),
        ]);
        assert_eq!(combined.sql, "(code = $1) OR (code = $2)");
        assert_eq!(combined.arg_count(), 2);

        assert!(Predicate::any(vec![]).is_always_false());

        let single = Predicate::any(vec![Predicate::bare("x IS NULL")]);
        assert_eq!(single.sql, "x IS NULL");
    }

    #[test]
    fn test_sql_param_display() {
        assert_eq!(SqlParam::text("hello").as_display_str(), "hello");
        assert_eq!(SqlParam::Integer(42).as_display_str(), "42");
        assert_eq!(SqlParam::Boolean(true).as_display_str(), "true");
        assert_eq!(
            SqlParam::TextArray(vec!["a".into(), "b".into()]).as_display_str(),
            "{a,b}"
        );
    }

    #[test]
    fn test_built_query_display() {
        let query = BuiltQuery {
            sql: "SELECT * FROM patients".to_string(),
            params: vec![],
        };
        assert_eq!(format!("{}", query), "SELECT * FROM patients");
    }

    #[test]
    fn test_parenthesize() {
        assert_eq!(parenthesize("a = $1"), "(a = $1)");
        assert_eq!(parenthesize("(a = $1 AND b = $2)"), "(a = $1 AND b = $2)");
        assert_eq!(parenthesize("(a = $1) OR (b = $2)"), "((a = $1) OR (b = $2))");
        assert_eq!(parenthesize("NOT (a = $1)"), "(NOT (a = $1))");
    }
}
