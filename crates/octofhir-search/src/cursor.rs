//! Signed pagination cursors.
//!
//! A [`PageCursor`] records the sort-key values of a page's boundary row.
//! [`CursorCodec`] turns it into an opaque token:
//!
//! ```text
//! base64url_nopad( HMAC-SHA256(secret, payload) [32 bytes] || payload )
//! ```
//!
//! where `payload` is the cursor's JSON. Decoding recomputes the MAC and
//! compares in constant time; a wrong secret, any flipped bit or a truncated
//! token is a hard failure.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::fmt;
use time::{Duration, OffsetDateTime};

use crate::keyset::SortKey;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("Malformed cursor: {0}")]
    Malformed(String),

    #[error("Cursor is truncated")]
    Truncated,

    #[error("Cursor signature does not match")]
    InvalidSignature,

    #[error("Cursor expired ({age_secs}s old, ttl {ttl_secs}s)")]
    Expired { age_secs: i64, ttl_secs: i64 },

    #[error("Cursor signing key must not be empty")]
    InvalidKey,

    #[error("Failed to encode cursor: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Direction a cursor walks the canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    #[default]
    Forward,
    Backward,
}

impl CursorDirection {
    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }
}

/// A position in an ordered result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Boundary-row values by storage column (tiebreaker excluded).
    pub values: IndexMap<String, Value>,
    /// Boundary-row id.
    pub id: Value,
    pub direction: CursorDirection,
    /// Sort keys the cursor was minted against, tiebreaker included.
    pub sort: Vec<SortKey>,
    pub page_size: usize,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
}

impl PageCursor {
    /// Mint a cursor stamped with the current time (whole seconds).
    pub fn new(
        values: IndexMap<String, Value>,
        id: Value,
        direction: CursorDirection,
        sort: Vec<SortKey>,
        page_size: usize,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            values,
            id,
            direction,
            sort: crate::keyset::with_tiebreaker(&sort),
            page_size,
            created_at: now.replace_nanosecond(0).unwrap_or(now),
        }
    }

    #[must_use]
    pub fn with_direction(mut self, direction: CursorDirection) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether the cursor was minted against exactly these keys.
    pub fn matches_sort(&self, sort: &[SortKey]) -> bool {
        self.sort == crate::keyset::with_tiebreaker(sort)
    }
}

/// Signs and verifies cursor tokens with one process-wide secret.
#[derive(Clone)]
pub struct CursorCodec {
    key: Vec<u8>,
}

impl fmt::Debug for CursorCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorCodec").finish_non_exhaustive()
    }
}

impl CursorCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, CursorError> {
        let key = secret.as_ref();
        if key.is_empty() {
            return Err(CursorError::InvalidKey);
        }
        Ok(Self { key: key.to_vec() })
    }

    fn mac(&self) -> Result<HmacSha256, CursorError> {
        HmacSha256::new_from_slice(&self.key).map_err(|_| CursorError::InvalidKey)
    }

    pub fn encode(&self, cursor: &PageCursor) -> Result<String, CursorError> {
        let payload = serde_json::to_vec(cursor)?;
        let mut mac = self.mac()?;
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        let mut token = Vec::with_capacity(SIGNATURE_LEN + payload.len());
        token.extend_from_slice(&signature);
        token.extend_from_slice(&payload);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    pub fn decode(&self, token: &str) -> Result<PageCursor, CursorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| CursorError::Malformed(e.to_string()))?;
        if bytes.len() <= SIGNATURE_LEN {
            return Err(CursorError::Truncated);
        }

        let (signature, payload) = bytes.split_at(SIGNATURE_LEN);
        let mut mac = self.mac()?;
        mac.update(payload);
        mac.verify_slice(signature)
            .map_err(|_| CursorError::InvalidSignature)?;

        serde_json::from_slice(payload).map_err(|e| CursorError::Malformed(e.to_string()))
    }

    /// Decode and reject cursors older than `ttl`.
    pub fn decode_with_ttl(&self, token: &str, ttl: Duration) -> Result<PageCursor, CursorError> {
        self.decode_with_ttl_at(token, ttl, OffsetDateTime::now_utc())
    }

    pub fn decode_with_ttl_at(
        &self,
        token: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<PageCursor, CursorError> {
        let cursor = self.decode(token)?;
        let age = now - cursor.created_at;
        if age > ttl {
            return Err(CursorError::Expired {
                age_secs: age.whole_seconds(),
                ttl_secs: ttl.whole_seconds(),
            });
        }
        Ok(cursor)
    }
}
