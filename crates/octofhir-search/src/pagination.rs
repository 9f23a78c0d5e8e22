//! Page requests and page assembly.
//!
//! A [`Paginator`] turns the paging parameters of a request into a
//! [`PageRequest`], shapes the query for it, and after execution turns the
//! fetched rows into a [`Page`] with `self`/`next`/`previous` links.
//!
//! Every page is fetched with one look-ahead row (`LIMIT count + 1`); its
//! presence is what tells us another page exists in the traversal direction.

use crate::config::PaginationConfig;
use crate::cursor::{CursorCodec, CursorDirection, CursorError, PageCursor};
use crate::keyset::{
    ID_COLUMN, KeysetError, SortKey, build_keyset_clause, build_traversal_order_clause,
    with_tiebreaker,
};
use crate::sql_builder::QueryBuilder;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use url::Url;

pub const COUNT_PARAM: &str = "_count";
pub const SORT_PARAM: &str = "_sort";
pub const CURSOR_PARAM: &str = "_cursor";
pub const CURSOR_PREV_PARAM: &str = "_cursor:prev";
pub const OFFSET_PARAM: &str = "_offset";

#[derive(Debug, thiserror::Error)]
pub enum PaginationError {
    #[error("_cursor and _cursor:prev cannot be used together")]
    ConflictingCursors,

    #[error("Invalid _count value: {0}")]
    InvalidCount(String),

    #[error("Invalid _offset value: {0}")]
    InvalidOffset(String),

    #[error("Cursor pagination is disabled on this server")]
    CursorsDisabled,

    #[error("_offset is not supported with cursor pagination")]
    OffsetWithCursors,

    #[error("Cursor was issued for a different _sort")]
    SortMismatch,

    #[error("Cursor direction does not match {0}")]
    DirectionMismatch(&'static str),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Keyset(#[from] KeysetError),
}

impl PaginationError {
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Cursor(CursorError::Encode(_) | CursorError::InvalidKey) => false,
            Self::Keyset(KeysetError::InvalidColumn(_)) => false,
            _ => true,
        }
    }
}

/// Raw paging parameters as they appeared on the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagingParams {
    pub count: Option<String>,
    pub sort: Option<String>,
    pub cursor: Option<String>,
    pub cursor_prev: Option<String>,
    pub offset: Option<String>,
}

impl PagingParams {
    pub fn is_paging_param(name: &str) -> bool {
        matches!(
            name,
            COUNT_PARAM | SORT_PARAM | CURSOR_PARAM | CURSOR_PREV_PARAM | OFFSET_PARAM
        )
    }

    /// Record a paging parameter. Returns `false` for any other name.
    pub fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            COUNT_PARAM => &mut self.count,
            SORT_PARAM => &mut self.sort,
            CURSOR_PARAM => &mut self.cursor,
            CURSOR_PREV_PARAM => &mut self.cursor_prev,
            OFFSET_PARAM => &mut self.offset,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageMode {
    /// `None` is the first page.
    Keyset(Option<PageCursor>),
    Offset(usize),
}

/// What one page of a search asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub count: usize,
    /// Effective sort keys, tiebreaker included.
    pub sort: Vec<SortKey>,
    pub mode: PageMode,
}

impl PageRequest {
    pub fn cursor(&self) -> Option<&PageCursor> {
        match &self.mode {
            PageMode::Keyset(cursor) => cursor.as_ref(),
            PageMode::Offset(_) => None,
        }
    }

    pub fn direction(&self) -> CursorDirection {
        self.cursor()
            .map(|cursor| cursor.direction)
            .unwrap_or_default()
    }

    /// Rows to fetch: the page plus one look-ahead row.
    pub fn fetch_limit(&self) -> usize {
        self.count + 1
    }

    /// `_sort` rendering of the effective keys (tiebreaker omitted).
    pub fn sort_param(&self) -> String {
        self.sort
            .iter()
            .filter(|key| !key.is_tiebreaker())
            .map(SortKey::to_sort_param)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Add the boundary predicate, traversal order and limit to `builder`.
    ///
    /// The boundary predicate is numbered after whatever filters the builder
    /// already holds.
    pub fn apply(&self, builder: &mut QueryBuilder) -> Result<(), KeysetError> {
        if let Some(predicate) = build_keyset_clause(self.cursor(), builder.idx())? {
            builder.push(predicate);
        }
        builder.order_by(build_traversal_order_clause(&self.sort, self.direction()));
        builder.limit(self.fetch_limit());
        if let PageMode::Offset(offset) = self.mode {
            builder.offset(offset);
        }
        Ok(())
    }
}

/// Access to the sort-key values of a fetched row.
pub trait BoundaryRow {
    fn column_value(&self, column: &str) -> Option<Value>;
}

impl BoundaryRow for Map<String, Value> {
    fn column_value(&self, column: &str) -> Option<Value> {
        self.get(column).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLinks {
    pub self_link: String,
    pub next: Option<String>,
    pub previous: Option<String>,
}

/// Rows of one page in canonical order, with navigation links.
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub rows: Vec<R>,
    pub links: PageLinks,
}

/// Paging policy for one server: counts, cursor mode and the signing key.
#[derive(Debug, Clone)]
pub struct Paginator {
    config: PaginationConfig,
    codec: Option<CursorCodec>,
}

impl Paginator {
    pub fn new(config: PaginationConfig) -> Result<Self, CursorError> {
        let codec = if config.cursor_enabled {
            Some(CursorCodec::new(config.secret.as_bytes())?)
        } else {
            None
        };
        Ok(Self { config, codec })
    }

    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    pub fn codec(&self) -> Option<&CursorCodec> {
        self.codec.as_ref()
    }

    /// Interpret the paging parameters of a request against `sort`.
    pub fn request(
        &self,
        params: &PagingParams,
        sort: &[SortKey],
    ) -> Result<PageRequest, PaginationError> {
        let sort = with_tiebreaker(sort);
        let requested = params
            .count
            .as_deref()
            .map(parse_count)
            .transpose()?;

        let Some(codec) = &self.codec else {
            if params.cursor.is_some() || params.cursor_prev.is_some() {
                return Err(PaginationError::CursorsDisabled);
            }
            let offset = params
                .offset
                .as_deref()
                .map(|raw| {
                    raw.trim()
                        .parse::<usize>()
                        .map_err(|_| PaginationError::InvalidOffset(raw.to_string()))
                })
                .transpose()?
                .unwrap_or(0);
            return Ok(PageRequest {
                count: self.clamp(requested.unwrap_or(self.config.default_count)),
                sort,
                mode: PageMode::Offset(offset),
            });
        };

        if params.offset.is_some() {
            return Err(PaginationError::OffsetWithCursors);
        }
        let (token, direction, param) = match (&params.cursor, &params.cursor_prev) {
            (Some(_), Some(_)) => return Err(PaginationError::ConflictingCursors),
            (Some(token), None) => (Some(token), CursorDirection::Forward, CURSOR_PARAM),
            (None, Some(token)) => (Some(token), CursorDirection::Backward, CURSOR_PREV_PARAM),
            (None, None) => (None, CursorDirection::Forward, CURSOR_PARAM),
        };

        let cursor = match token {
            None => None,
            Some(token) => match codec.decode_with_ttl(token, self.config.cursor_ttl()) {
                Ok(cursor) => Some(cursor),
                Err(err) if self.config.fallback_offset => {
                    tracing::warn!(error = %err, "invalid cursor, serving first page");
                    None
                }
                Err(err) => return Err(err.into()),
            },
        };

        if let Some(cursor) = &cursor {
            if cursor.direction != direction {
                return Err(PaginationError::DirectionMismatch(param));
            }
            if !cursor.matches_sort(&sort) {
                return Err(PaginationError::SortMismatch);
            }
        }

        let count = requested
            .or_else(|| cursor.as_ref().map(|cursor| cursor.page_size))
            .unwrap_or(self.config.default_count);
        Ok(PageRequest {
            count: self.clamp(count),
            sort,
            mode: PageMode::Keyset(cursor),
        })
    }

    fn clamp(&self, count: usize) -> usize {
        count.min(self.config.max_count)
    }

    /// Turn the rows fetched for `request` into a page.
    ///
    /// `rows` must be in fetch order and may hold the look-ahead row.
    /// `base` is the request URL; its filter parameters are carried into
    /// every link and its paging parameters are replaced.
    pub fn finish_page<R: BoundaryRow>(
        &self,
        request: &PageRequest,
        mut rows: Vec<R>,
        base: &Url,
    ) -> Result<Page<R>, PaginationError> {
        let has_more = rows.len() > request.count;
        rows.truncate(request.count);

        let links = match &request.mode {
            PageMode::Offset(offset) => self.offset_links(request, *offset, has_more, base),
            PageMode::Keyset(cursor) => {
                if request.direction() == CursorDirection::Backward {
                    rows.reverse();
                }
                self.keyset_links(request, cursor.as_ref(), &rows, has_more, base)?
            }
        };
        Ok(Page { rows, links })
    }

    fn offset_links(
        &self,
        request: &PageRequest,
        offset: usize,
        has_more: bool,
        base: &Url,
    ) -> PageLinks {
        let at = |offset: usize| -> Vec<(&'static str, String)> {
            if offset == 0 {
                Vec::new()
            } else {
                vec![(OFFSET_PARAM, offset.to_string())]
            }
        };
        // A zero-sized page never moves.
        let moves = request.count > 0;
        PageLinks {
            self_link: page_link(base, request, &at(offset)),
            next: (moves && has_more)
                .then(|| page_link(base, request, &at(offset + request.count))),
            previous: (moves && offset > 0)
                .then(|| page_link(base, request, &at(offset.saturating_sub(request.count)))),
        }
    }

    fn keyset_links<R: BoundaryRow>(
        &self,
        request: &PageRequest,
        cursor: Option<&PageCursor>,
        rows: &[R],
        has_more: bool,
        base: &Url,
    ) -> Result<PageLinks, PaginationError> {
        let Some(codec) = &self.codec else {
            return Err(PaginationError::CursorsDisabled);
        };

        let current = match cursor {
            Some(cursor) => {
                let param = match cursor.direction {
                    CursorDirection::Forward => CURSOR_PARAM,
                    CursorDirection::Backward => CURSOR_PREV_PARAM,
                };
                vec![(param, codec.encode(cursor)?)]
            }
            None => Vec::new(),
        };
        let self_link = page_link(base, request, &current);

        // Backward pages always have something after them; forward pages
        // have something before them unless they are the first page.
        let (more_after, more_before) = match request.direction() {
            CursorDirection::Forward => (has_more, cursor.is_some()),
            CursorDirection::Backward => (true, has_more),
        };
        let moves = request.count > 0;

        let mut next = None;
        let mut previous = None;
        if moves
            && more_after
            && let Some(edge) = edge_cursor(request, cursor, rows.last(), CursorDirection::Forward)?
        {
            let token = codec.encode(&edge)?;
            next = Some(page_link(base, request, &[(CURSOR_PARAM, token)]));
        }
        if moves
            && more_before
            && let Some(edge) =
                edge_cursor(request, cursor, rows.first(), CursorDirection::Backward)?
        {
            let token = codec.encode(&edge)?;
            previous = Some(page_link(base, request, &[(CURSOR_PREV_PARAM, token)]));
        }

        Ok(PageLinks {
            self_link,
            next,
            previous,
        })
    }
}

fn parse_count(raw: &str) -> Result<usize, PaginationError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| PaginationError::InvalidCount(raw.to_string()))
}

/// Cursor for a link leaving the page in `direction`: at the edge `row`, or,
/// when the page came back empty, at the incoming cursor's boundary turned
/// around.
fn edge_cursor<R: BoundaryRow>(
    request: &PageRequest,
    incoming: Option<&PageCursor>,
    row: Option<&R>,
    direction: CursorDirection,
) -> Result<Option<PageCursor>, KeysetError> {
    match (row, incoming) {
        (Some(row), _) => boundary_cursor(request, row, direction).map(Some),
        (None, Some(cursor)) if cursor.direction != direction => Ok(Some(PageCursor::new(
            cursor.values.clone(),
            cursor.id.clone(),
            direction,
            request.sort.clone(),
            request.count,
        ))),
        (None, _) => Ok(None),
    }
}

/// Mint a cursor at `row` for the keys of `request`.
fn boundary_cursor<R: BoundaryRow>(
    request: &PageRequest,
    row: &R,
    direction: CursorDirection,
) -> Result<PageCursor, KeysetError> {
    let mut values = IndexMap::new();
    for key in request.sort.iter().filter(|key| !key.is_tiebreaker()) {
        let value = row
            .column_value(&key.column)
            .ok_or_else(|| KeysetError::MissingValue(key.column.clone()))?;
        values.insert(key.column.clone(), value);
    }
    let id = row
        .column_value(ID_COLUMN)
        .ok_or_else(|| KeysetError::MissingValue(ID_COLUMN.to_string()))?;
    Ok(PageCursor::new(
        values,
        id,
        direction,
        request.sort.clone(),
        request.count,
    ))
}

/// `base` with its paging parameters replaced by `_count`, `_sort` and
/// `extra`.
fn page_link(base: &Url, request: &PageRequest, extra: &[(&str, String)]) -> String {
    let filters: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(name, _)| !PagingParams::is_paging_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut url = base.clone();
    url.set_query(None);
    {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in &filters {
            pairs.append_pair(name, value);
        }
        pairs.append_pair(COUNT_PARAM, &request.count.to_string());
        pairs.append_pair(SORT_PARAM, &request.sort_param());
        for (name, value) in extra {
            pairs.append_pair(name, value);
        }
    }
    url.to_string()
}
