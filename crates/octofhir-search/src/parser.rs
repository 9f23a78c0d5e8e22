//! Query-string parsing.
//!
//! Splits a FHIR search query into the paging parameters and the filters the
//! compiler turns into predicates. Values are kept raw: comma-separated OR
//! lists and prefixes are interpreted later, per parameter kind.

use crate::chaining::is_chained_parameter;
use crate::pagination::PagingParams;
use crate::reverse_chaining::is_reverse_chain_parameter;
use url::form_urlencoded;

/// Parameters that shape the response rather than select rows.
pub const RESULT_PARAMS: &[&str] = &[
    "_format",
    "_pretty",
    "_summary",
    "_elements",
    "_total",
    "_include",
    "_revinclude",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// `name` or `name:modifier`.
    Field,
    /// `ref.field` or `ref:Type.field`.
    Chain,
    /// `_has:Type:refParam:searchParam`.
    ReverseChain,
}

/// One filter occurrence. Repeated names are separate filters (AND).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterParam {
    /// Full parameter name including any modifier suffix.
    pub name: String,
    pub value: String,
    pub kind: FilterKind,
}

impl FilterParam {
    /// Name without the modifier suffix.
    pub fn base_name(&self) -> &str {
        match self.kind {
            FilterKind::Field => self.name.split(':').next().unwrap_or(&self.name),
            FilterKind::Chain | FilterKind::ReverseChain => &self.name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    pub paging: PagingParams,
    pub filters: Vec<FilterParam>,
}

pub struct SearchParameterParser;

impl SearchParameterParser {
    /// Parse an `application/x-www-form-urlencoded` query string.
    ///
    /// Example: `name:exact=John&_has:Observation:patient:code=1234&_count=5`
    pub fn parse_query(query: &str) -> ParsedQuery {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut parsed = ParsedQuery::default();

        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            let name = name.trim();
            if name.is_empty() || RESULT_PARAMS.contains(&name) {
                continue;
            }
            if parsed.paging.set(name, value.trim().to_string()) {
                continue;
            }
            // Empty values are ignored per FHIR search rules
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            parsed.filters.push(FilterParam {
                name: name.to_string(),
                value: value.to_string(),
                kind: Self::classify(name),
            });
        }

        tracing::debug!(
            filters = parsed.filters.len(),
            cursor = parsed.paging.cursor.is_some() || parsed.paging.cursor_prev.is_some(),
            "parsed search query"
        );
        parsed
    }

    pub fn classify(name: &str) -> FilterKind {
        if is_reverse_chain_parameter(name) {
            FilterKind::ReverseChain
        } else if is_chained_parameter(name) {
            FilterKind::Chain
        } else {
            FilterKind::Field
        }
    }
}
