//! Process-scoped read-through cache for status-code lookups

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::traits::{StatusEntry, StatusSource};
use crate::types::{ClearingError, ClearingResult};

/// Read-through cache over a [`StatusSource`].
///
/// Built explicitly (no globals), warmed once at startup, and lazily filled
/// on a miss. Lookups never mutate ledger state; a code the source does not
/// know is an internal error, since every status this crate writes must
/// exist in the status master.
#[derive(Clone)]
pub struct StatusCache {
    source: Arc<dyn StatusSource>,
    by_code: Arc<RwLock<HashMap<(String, String), i32>>>,
    by_id: Arc<RwLock<HashMap<(String, i32), String>>>,
}

impl StatusCache {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self {
            source,
            by_code: Arc::new(RwLock::new(HashMap::new())),
            by_id: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Preload every status row. Failures are non-fatal: the cache will
    /// lazily fill on first miss instead.
    pub async fn warm(&self) {
        match self.source.load_all().await {
            Ok(entries) => self.insert_all(entries),
            Err(err) => {
                tracing::warn!("status cache warm-up failed, will fill lazily: {err}");
            }
        }
    }

    /// Resolve a status id, filling the cache from the source on a miss
    pub async fn require_id(&self, domain: &str, code: &str) -> ClearingResult<i32> {
        let key = (domain.to_string(), code.to_string());
        if let Some(id) = self.by_code.read().unwrap().get(&key) {
            return Ok(*id);
        }
        let id = self
            .source
            .load_status_id(domain, code)
            .await?
            .ok_or_else(|| {
                ClearingError::Internal(format!(
                    "Status not found for domain={domain} code={code}"
                ))
            })?;
        self.insert_all(vec![StatusEntry {
            domain: domain.to_string(),
            code: code.to_string(),
            id,
        }]);
        Ok(id)
    }

    /// Reverse lookup: the code behind a status id, if known.
    ///
    /// Tries the cached reverse map, warming once from the source on a miss.
    pub async fn resolve_code(&self, domain: &str, status_id: i32) -> Option<String> {
        let key = (domain.to_string(), status_id);
        if let Some(code) = self.by_id.read().unwrap().get(&key) {
            return Some(code.clone());
        }
        self.warm().await;
        self.by_id.read().unwrap().get(&key).cloned()
    }

    fn insert_all(&self, entries: Vec<StatusEntry>) {
        let mut by_code = self.by_code.write().unwrap();
        let mut by_id = self.by_id.write().unwrap();
        for entry in entries {
            by_code.insert((entry.domain.clone(), entry.code.clone()), entry.id);
            by_id.insert((entry.domain, entry.id), entry.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::status_domain;
    use crate::utils::StaticStatusSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: StaticStatusSource,
        single_loads: AtomicUsize,
    }

    #[async_trait]
    impl StatusSource for CountingSource {
        async fn load_status_id(&self, domain: &str, code: &str) -> ClearingResult<Option<i32>> {
            self.single_loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load_status_id(domain, code).await
        }

        async fn load_all(&self) -> ClearingResult<Vec<StatusEntry>> {
            Err(ClearingError::Storage("status master unavailable".into()))
        }
    }

    #[tokio::test]
    async fn lazy_fill_hits_the_source_once_per_code() {
        let source = Arc::new(CountingSource {
            inner: StaticStatusSource::with_defaults(),
            single_loads: AtomicUsize::new(0),
        });
        let cache = StatusCache::new(source.clone());
        // Warm failure is tolerated
        cache.warm().await;

        let first = cache
            .require_id(status_domain::PAYMENT_ALLOCATION, "ALLOCATED")
            .await
            .unwrap();
        let second = cache
            .require_id(status_domain::PAYMENT_ALLOCATION, "ALLOCATED")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(source.single_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_code_is_an_internal_error() {
        let cache = StatusCache::new(Arc::new(StaticStatusSource::with_defaults()));
        let err = cache
            .require_id(status_domain::PAYMENT_ALLOCATION, "NO_SUCH_CODE")
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::Internal(_)));
    }

    #[tokio::test]
    async fn resolve_code_round_trips_after_warm() {
        let cache = StatusCache::new(Arc::new(StaticStatusSource::with_defaults()));
        cache.warm().await;
        let id = cache
            .require_id(status_domain::REQUEST_SETTLEMENT, "SETTLED")
            .await
            .unwrap();
        assert_eq!(
            cache
                .resolve_code(status_domain::REQUEST_SETTLEMENT, id)
                .await
                .as_deref(),
            Some("SETTLED")
        );
    }
}
