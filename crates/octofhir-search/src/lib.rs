//! FHIR search query compiler with signed keyset pagination.
//!
//! A search request is compiled into one parameterized PostgreSQL `SELECT`
//! whose `$N` placeholders and bind values line up exactly. Pages are
//! addressed by HMAC-signed cursors and fetched with keyset predicates.

pub mod chaining;
pub mod common;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod keyset;
pub mod modifiers;
pub mod pagination;
pub mod parameters;
pub mod parser;
pub mod registry;
pub mod reverse_chaining;
pub mod sql_builder;
pub mod terminology;
pub mod types;

pub use chaining::{ChainedSearchConfig, ChainingError, MAX_CHAIN_DEPTH};
pub use common::register_common_parameters;
pub use crate::config::{ConfigError, PaginationConfig, SearchSettings};
pub use cursor::{CursorCodec, CursorDirection, CursorError, PageCursor};
pub use engine::{CompiledSearch, SearchCompiler};
pub use error::SearchError;
pub use keyset::{SortKey, build_keyset_clause, build_keyset_order_clause};
pub use pagination::{
    BoundaryRow, Page, PageLinks, PageMode, PageRequest, Paginator, PagingParams,
};
pub use parameters::{SearchModifier, SearchParamConfig, SearchParameterType, SearchPrefix};
pub use parser::{FilterKind, FilterParam, ParsedQuery, SearchParameterParser};
pub use registry::{ChainRegistry, SearchParameterRegistry};
pub use reverse_chaining::{ReverseChainConfig, ReverseChainingError};
pub use sql_builder::{BuiltQuery, Predicate, QueryBuilder, SqlBuilderError, SqlParam};
pub use terminology::{
    CachedExpander, InMemoryValueSets, TerminologyError, ValueSetConcept, ValueSetExpander,
};
