//! Keyset pagination clause builder.
//!
//! A cursor minted at boundary row `R` is expanded into the canonical OR form
//! over the sort keys `c1..cN` (the last one always the `id` tiebreaker):
//!
//! ```text
//! (c1 op1 v1) OR (c1 = v1 AND c2 op2 v2) OR ... OR (c1 = v1 AND ... AND cN opN vN)
//! ```
//!
//! `op` depends on the key's own direction and on the traversal direction:
//!
//! | key  | forward | backward |
//! |------|---------|----------|
//! | asc  | `>`     | `<`      |
//! | desc | `<`     | `>`      |
//!
//! Rows are ordered `NULLS LAST` on every key. A NULL cursor value has
//! nothing after it (the strict term is dropped going forward) and every
//! non-null value before it (`IS NOT NULL` going backward); equality against
//! it is `IS NULL`. Keys marked nullable also pick up `OR col IS NULL` on the
//! forward side of a non-null value.
//!
//! Each cursor value is bound once; its placeholder is reused by every clause
//! that mentions the column.

use crate::cursor::{CursorDirection, PageCursor};
use crate::parameters::SearchParameterType;
use crate::sql_builder::{
    Predicate, SqlBuilderError, SqlParam, parenthesize, validate_identifier,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage column of the unique row identifier.
pub const ID_COLUMN: &str = "id";

#[derive(Debug, thiserror::Error)]
pub enum KeysetError {
    #[error("Cursor has no value for sort column {0}")]
    MissingValue(String),

    #[error("Cursor value for {0} cannot be bound")]
    UnsupportedValue(String),

    #[error("Invalid sort column: {0}")]
    InvalidColumn(#[from] SqlBuilderError),
}

/// One component of the result ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Public search field (`_lastUpdated`, `birthdate`).
    pub field: String,
    /// Storage column.
    pub column: String,
    pub ascending: bool,
    /// Whether the column may hold NULL.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub nullable: bool,
    /// Kind of the sorted parameter; decides how cursor values are bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SearchParameterType>,
}

impl SortKey {
    pub fn new(field: impl Into<String>, column: impl Into<String>, ascending: bool) -> Self {
        Self {
            field: field.into(),
            column: column.into(),
            ascending,
            nullable: false,
            kind: None,
        }
    }

    pub fn asc(field: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(field, column, true)
    }

    pub fn desc(field: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(field, column, false)
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: SearchParameterType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// The default `-_lastUpdated` ordering.
    pub fn last_updated() -> Self {
        Self::desc("_lastUpdated", "last_updated").with_kind(SearchParameterType::Date)
    }

    /// The implicit `id DESC` tiebreaker.
    pub fn tiebreaker() -> Self {
        Self::desc(ID_COLUMN, ID_COLUMN)
    }

    pub fn is_tiebreaker(&self) -> bool {
        self.column == ID_COLUMN
    }

    /// Render as a `_sort` item (`field` or `-field`).
    pub fn to_sort_param(&self) -> String {
        if self.ascending {
            self.field.clone()
        } else {
            format!("-{}", self.field)
        }
    }
}

/// Append the `id DESC` tiebreaker unless an `id` key is already present.
pub fn with_tiebreaker(keys: &[SortKey]) -> Vec<SortKey> {
    let mut keys = keys.to_vec();
    if !keys.iter().any(SortKey::is_tiebreaker) {
        keys.push(SortKey::tiebreaker());
    }
    keys
}

/// Comparison operator for a key in a traversal direction.
pub fn keyset_operator(ascending: bool, direction: CursorDirection) -> &'static str {
    match (ascending, direction) {
        (true, CursorDirection::Forward) | (false, CursorDirection::Backward) => ">",
        (true, CursorDirection::Backward) | (false, CursorDirection::Forward) => "<",
    }
}

// ============================================================================
// Clause terms
// ============================================================================

/// One comparison inside an expanded keyset clause. Placeholders are
/// absolute `$N` numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeysetTerm {
    Eq { column: String, placeholder: usize },
    IsNull { column: String },
    Cmp { column: String, op: &'static str, placeholder: usize, or_null: bool },
    IsNotNull { column: String },
}

impl KeysetTerm {
    fn render(&self) -> String {
        match self {
            Self::Eq { column, placeholder } => format!("{column} = ${placeholder}"),
            Self::IsNull { column } => format!("{column} IS NULL"),
            Self::Cmp { column, op, placeholder, or_null: false } => {
                format!("{column} {op} ${placeholder}")
            }
            Self::Cmp { column, op, placeholder, or_null: true } => {
                format!("({column} {op} ${placeholder} OR {column} IS NULL)")
            }
            Self::IsNotNull { column } => format!("{column} IS NOT NULL"),
        }
    }
}

/// Expanded keyset: the OR-ed clauses of AND-ed terms plus the bind values
/// numbered from the start index.
#[derive(Debug, Clone)]
pub(crate) struct KeysetExpansion {
    pub clauses: Vec<Vec<KeysetTerm>>,
    pub params: Vec<SqlParam>,
}

impl KeysetExpansion {
    fn into_predicate(self) -> Predicate {
        if self.clauses.is_empty() {
            return Predicate::always_false();
        }
        let sql = self
            .clauses
            .iter()
            .map(|terms| {
                let rendered: Vec<String> = terms.iter().map(KeysetTerm::render).collect();
                parenthesize(&rendered.join(" AND "))
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        Predicate::new(sql, self.params)
    }
}

/// Look up the cursor's value for a key; the tiebreaker reads the row id.
fn cursor_value<'a>(cursor: &'a PageCursor, key: &SortKey) -> Result<&'a Value, KeysetError> {
    if key.is_tiebreaker() {
        return Ok(&cursor.id);
    }
    cursor
        .values
        .get(&key.column)
        .ok_or_else(|| KeysetError::MissingValue(key.column.clone()))
}

/// Convert a cursor value into a bind value. Strings on date keys bind as
/// timestamps.
pub(crate) fn bind_value(key: &SortKey, value: &Value) -> Result<SqlParam, KeysetError> {
    let column = key.column.as_str();
    match value {
        Value::String(s) if key.kind == Some(SearchParameterType::Date) => {
            Ok(SqlParam::Timestamp(s.clone()))
        }
        Value::String(s) => Ok(SqlParam::Text(s.clone())),
        Value::Bool(b) => Ok(SqlParam::Boolean(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlParam::Integer)
            .or_else(|| n.as_f64().map(SqlParam::Float))
            .ok_or_else(|| KeysetError::UnsupportedValue(column.to_string())),
        Value::Null | Value::Array(_) | Value::Object(_) => {
            Err(KeysetError::UnsupportedValue(column.to_string()))
        }
    }
}

pub(crate) fn expand_keyset(
    cursor: &PageCursor,
    start: usize,
) -> Result<KeysetExpansion, KeysetError> {
    let keys = with_tiebreaker(&cursor.sort);
    let direction = cursor.direction;

    // Bind every non-null value once, in key order.
    let mut params = Vec::new();
    let mut placeholders: Vec<Option<usize>> = Vec::with_capacity(keys.len());
    for key in &keys {
        validate_identifier(&key.column)?;
        let value = cursor_value(cursor, key)?;
        if value.is_null() {
            placeholders.push(None);
        } else {
            placeholders.push(Some(start + params.len()));
            params.push(bind_value(key, value)?);
        }
    }

    let mut clauses = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        let strict = match placeholders[i] {
            Some(placeholder) => KeysetTerm::Cmp {
                column: key.column.clone(),
                op: keyset_operator(key.ascending, direction),
                placeholder,
                or_null: key.nullable && direction == CursorDirection::Forward,
            },
            None if direction == CursorDirection::Backward => KeysetTerm::IsNotNull {
                column: key.column.clone(),
            },
            None => continue,
        };

        let mut terms: Vec<KeysetTerm> = keys[..i]
            .iter()
            .zip(&placeholders[..i])
            .map(|(prev, placeholder)| match placeholder {
                Some(placeholder) => KeysetTerm::Eq {
                    column: prev.column.clone(),
                    placeholder: *placeholder,
                },
                None => KeysetTerm::IsNull {
                    column: prev.column.clone(),
                },
            })
            .collect();
        terms.push(strict);
        clauses.push(terms);
    }

    Ok(KeysetExpansion { clauses, params })
}

/// Build the boundary predicate for a cursor, numbered from `start`.
///
/// No cursor means the first page: no predicate at all.
pub fn build_keyset_clause(
    cursor: Option<&PageCursor>,
    start: usize,
) -> Result<Option<Predicate>, KeysetError> {
    let Some(cursor) = cursor else {
        return Ok(None);
    };
    let predicate = expand_keyset(cursor, start)?.into_predicate();
    tracing::debug!(
        direction = ?cursor.direction,
        sql = %predicate.sql,
        args = predicate.arg_count(),
        "compiled keyset boundary"
    );
    Ok(Some(predicate))
}

/// Canonical `ORDER BY` list: every key `NULLS LAST`, `id` tiebreaker
/// appended if absent.
pub fn build_keyset_order_clause(keys: &[SortKey]) -> String {
    with_tiebreaker(keys)
        .iter()
        .map(|key| {
            let dir = if key.ascending { "ASC" } else { "DESC" };
            format!("{} {dir} NULLS LAST", key.column)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `ORDER BY` list used to fetch a page. Backward pages walk the canonical
/// order in reverse (every direction flipped, `NULLS FIRST`) and are reversed
/// back by the caller.
pub fn build_traversal_order_clause(keys: &[SortKey], direction: CursorDirection) -> String {
    match direction {
        CursorDirection::Forward => build_keyset_order_clause(keys),
        CursorDirection::Backward => with_tiebreaker(keys)
            .iter()
            .map(|key| {
                let dir = if key.ascending { "DESC" } else { "ASC" };
                format!("{} {dir} NULLS FIRST", key.column)
            })
            .collect::<Vec<_>>()
            .join(", "),
    }
}
