use crate::chaining::ChainingError;
use crate::config::ConfigError;
use crate::cursor::CursorError;
use crate::keyset::KeysetError;
use crate::pagination::PaginationError;
use crate::reverse_chaining::ReverseChainingError;
use crate::sql_builder::SqlBuilderError;
use crate::terminology::TerminologyError;
use thiserror::Error;

/// Request-level error for compiling and paging a search.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Unknown search parameter '{param}' for {resource_type}")]
    UnknownParameter {
        resource_type: String,
        param: String,
    },

    #[error("Unknown sort field '{field}' for {resource_type}")]
    UnknownSortField {
        resource_type: String,
        field: String,
    },

    #[error("Invalid resource type: {0}")]
    InvalidResourceType(String),

    #[error(transparent)]
    SqlBuilder(#[from] SqlBuilderError),

    #[error(transparent)]
    Chaining(#[from] ChainingError),

    #[error(transparent)]
    ReverseChaining(#[from] ReverseChainingError),

    #[error(transparent)]
    Pagination(#[from] PaginationError),

    #[error(transparent)]
    Terminology(#[from] TerminologyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<CursorError> for SearchError {
    fn from(err: CursorError) -> Self {
        Self::Pagination(err.into())
    }
}

impl From<KeysetError> for SearchError {
    fn from(err: KeysetError) -> Self {
        Self::Pagination(err.into())
    }
}

fn sql_builder_is_client_error(err: &SqlBuilderError) -> bool {
    // Identifiers come from registered configuration, never from the request.
    !matches!(err, SqlBuilderError::InvalidIdentifier(_))
}

impl SearchError {
    /// The request is at fault (maps to 4xx).
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::UnknownParameter { .. }
            | Self::UnknownSortField { .. }
            | Self::InvalidResourceType(_) => true,
            Self::SqlBuilder(err) => sql_builder_is_client_error(err),
            Self::Chaining(ChainingError::SqlBuilder(err)) => sql_builder_is_client_error(err),
            Self::Chaining(ChainingError::MissingLeafColumn(_)) => false,
            Self::Chaining(_) => true,
            Self::ReverseChaining(ReverseChainingError::SqlBuilder(err)) => {
                sql_builder_is_client_error(err)
            }
            Self::ReverseChaining(_) => true,
            Self::Pagination(err) => err.is_client_error(),
            Self::Terminology(TerminologyError::ValueSetNotFound(_)) => true,
            Self::Terminology(_) | Self::Config(_) => false,
        }
    }

    /// The server or its configuration is at fault (maps to 5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}
