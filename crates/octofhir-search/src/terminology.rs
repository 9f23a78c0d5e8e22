//! ValueSet expansion for `:in` / `:not-in`.
//!
//! The predicate compiler binds the ValueSet canonical URL as
//! [`SqlParam::ValueSetUrl`]. Before the query runs, the caller expands every
//! such parameter through a [`ValueSetExpander`] and binds the member codes
//! as a text array instead. The placeholder count does not change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::registry::{read, write};
use crate::sql_builder::SqlParam;

/// Errors from terminology operations.
#[derive(Debug, Error)]
pub enum TerminologyError {
    #[error("ValueSet not found: {0}")]
    ValueSetNotFound(String),

    #[error("ValueSet expansion failed for {url}: {message}")]
    ExpansionFailed { url: String, message: String },
}

/// One member of an expanded ValueSet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueSetConcept {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub code: String,
}

impl ValueSetConcept {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: code.into(),
        }
    }
}

/// Source of ValueSet expansions.
#[async_trait]
pub trait ValueSetExpander: Send + Sync {
    async fn expand(&self, url: &str) -> Result<Vec<ValueSetConcept>, TerminologyError>;
}

/// Replace every [`SqlParam::ValueSetUrl`] with the member codes of the set.
///
/// Codes are deduplicated in first-seen order. An empty expansion binds an
/// empty array, which `= ANY($n)` never matches.
pub async fn expand_value_set_params(
    params: &mut [SqlParam],
    expander: &dyn ValueSetExpander,
) -> Result<(), TerminologyError> {
    for param in params.iter_mut() {
        let SqlParam::ValueSetUrl(url) = param else {
            continue;
        };
        let concepts = expander.expand(url).await?;
        let mut codes: Vec<String> = Vec::with_capacity(concepts.len());
        for concept in concepts {
            if !codes.contains(&concept.code) {
                codes.push(concept.code);
            }
        }
        tracing::debug!(url = %url, codes = codes.len(), "expanded value set");
        *param = SqlParam::TextArray(codes);
    }
    Ok(())
}

/// Fixed ValueSets held in memory.
#[derive(Debug, Default)]
pub struct InMemoryValueSets {
    sets: RwLock<HashMap<String, Vec<ValueSetConcept>>>,
}

impl InMemoryValueSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, concepts: Vec<ValueSetConcept>) {
        write(&self.sets).insert(url.into(), concepts);
    }
}

#[async_trait]
impl ValueSetExpander for InMemoryValueSets {
    async fn expand(&self, url: &str) -> Result<Vec<ValueSetConcept>, TerminologyError> {
        read(&self.sets)
            .get(url)
            .cloned()
            .ok_or_else(|| TerminologyError::ValueSetNotFound(url.to_string()))
    }
}

/// Cached expansion entry with TTL tracking.
#[derive(Debug, Clone)]
struct CachedExpansion {
    concepts: Vec<ValueSetConcept>,
    cached_at: Instant,
}

/// Wraps an expander and keeps successful expansions for `ttl`.
pub struct CachedExpander {
    inner: Arc<dyn ValueSetExpander>,
    cache: RwLock<HashMap<String, CachedExpansion>>,
    ttl: Duration,
}

impl CachedExpander {
    pub fn new(inner: Arc<dyn ValueSetExpander>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn cached_len(&self) -> usize {
        read(&self.cache).len()
    }
}

#[async_trait]
impl ValueSetExpander for CachedExpander {
    async fn expand(&self, url: &str) -> Result<Vec<ValueSetConcept>, TerminologyError> {
        let fresh = read(&self.cache)
            .get(url)
            .filter(|hit| hit.cached_at.elapsed() < self.ttl)
            .map(|hit| hit.concepts.clone());
        if let Some(concepts) = fresh {
            return Ok(concepts);
        }

        let concepts = self.inner.expand(url).await?;
        let mut cache = write(&self.cache);
        cache.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        cache.insert(
            url.to_string(),
            CachedExpansion {
                concepts: concepts.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(concepts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const VS: &str = "http://hl7.org/fhir/ValueSet/observation-status";

    fn value_sets() -> InMemoryValueSets {
        let sets = InMemoryValueSets::new();
        sets.insert(
            VS,
            vec![
                ValueSetConcept::new("http://hl7.org/fhir/observation-status", "final"),
                ValueSetConcept::new("http://hl7.org/fhir/observation-status", "amended"),
                ValueSetConcept::new("http://example.org/other", "final"),
            ],
        );
        sets
    }

    #[test]
    fn test_expand_value_set_params() {
        let sets = value_sets();
        let mut params = vec![
            SqlParam::text("x"),
            SqlParam::ValueSetUrl(VS.to_string()),
        ];
        tokio_test::block_on(expand_value_set_params(&mut params, &sets)).unwrap();
        assert_eq!(params[0], SqlParam::text("x"));
        assert_eq!(
            params[1],
            SqlParam::TextArray(vec!["final".to_string(), "amended".to_string()])
        );
    }

    #[test]
    fn test_unknown_value_set() {
        let sets = InMemoryValueSets::new();
        let mut params = vec![SqlParam::ValueSetUrl("http://nope".to_string())];
        let err = tokio_test::block_on(expand_value_set_params(&mut params, &sets)).unwrap_err();
        assert!(matches!(err, TerminologyError::ValueSetNotFound(_)));
        assert_eq!(params[0], SqlParam::ValueSetUrl("http://nope".to_string()));
    }

    struct Counting {
        inner: InMemoryValueSets,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ValueSetExpander for Counting {
        async fn expand(&self, url: &str) -> Result<Vec<ValueSetConcept>, TerminologyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.expand(url).await
        }
    }

    #[test]
    fn test_cached_expander() {
        let counting = Arc::new(Counting {
            inner: value_sets(),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedExpander::new(counting.clone(), Duration::from_secs(60));

        tokio_test::block_on(async {
            assert_eq!(cached.expand(VS).await.unwrap().len(), 3);
            assert_eq!(cached.expand(VS).await.unwrap().len(), 3);
            assert!(cached.expand("http://nope").await.is_err());
        });
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.cached_len(), 1);
    }

    #[test]
    fn test_zero_ttl_always_refetches() {
        let counting = Arc::new(Counting {
            inner: value_sets(),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedExpander::new(counting.clone(), Duration::ZERO);
        tokio_test::block_on(async {
            cached.expand(VS).await.unwrap();
            cached.expand(VS).await.unwrap();
        });
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expired_entries_evicted_on_write() {
        let sets = value_sets();
        sets.insert(
            "http://example.org/vs/other",
            vec![ValueSetConcept::new("http://example.org/other", "x")],
        );
        let cached = CachedExpander::new(Arc::new(sets), Duration::ZERO);
        tokio_test::block_on(async {
            cached.expand(VS).await.unwrap();
            cached.expand("http://example.org/vs/other").await.unwrap();
        });
        assert_eq!(cached.cached_len(), 1);
    }
}
