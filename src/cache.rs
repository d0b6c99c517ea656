use crate::store::KvStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Market data goes stale quickly; analyses are expensive to recompute.
pub const MARKET_DATA_TTL: Duration = Duration::from_secs(60);
pub const AI_ANALYSIS_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache namespace, one per upstream data family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    CoinGecko,
    AiAnalysis,
}

impl Namespace {
    fn prefix(self) -> &'static str {
        match self {
            Namespace::CoinGecko => "coingecko",
            Namespace::AiAnalysis => "ai-analysis",
        }
    }

    /// Parameters that never change the underlying resource for this
    /// namespace. Pagination fragments the analysis cache for no reason,
    /// so it is stripped from analysis keys.
    fn ignored_params(self) -> &'static [&'static str] {
        match self {
            Namespace::CoinGecko => &[],
            Namespace::AiAnalysis => &["page", "per_page"],
        }
    }
}

/// Canonical cache key for a logical request: ignored parameters dropped,
/// the rest sorted by name and rendered as `name:<json>`, prefixed with
/// the namespace. Insertion order never affects the result.
pub fn cache_key(namespace: Namespace, params: &[(&str, Value)]) -> String {
    let mut entries: Vec<&(&str, Value)> = params
        .iter()
        .filter(|(name, _)| !namespace.ignored_params().contains(name))
        .collect();
    entries.sort_by_key(|(name, _)| *name);

    let rendered: Vec<String> = entries
        .iter()
        .map(|(name, value)| format!("{}:{}", name, value))
        .collect();

    format!("{}:{}", namespace.prefix(), rendered.join(":"))
}

/// Typed cache over the shared store.
///
/// Reads re-validate through serde: a stored value that no longer decodes
/// into the expected type counts as a miss. Store failures are logged and
/// swallowed — the cache is an optimization, never a correctness
/// dependency.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KvStore>,
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        params: &[(&str, Value)],
    ) -> Option<T> {
        let key = cache_key(namespace, params);

        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(%key, "cache miss");
                return None;
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!(%key, "cache hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "cached data failed validation, discarding");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        namespace: Namespace,
        params: &[(&str, Value)],
        value: &T,
        ttl: Duration,
    ) {
        let key = cache_key(namespace, params);

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%key, error = %e, "failed to serialize value for cache");
                return;
            }
        };

        match self.store.set(&key, raw, ttl).await {
            Ok(()) => tracing::debug!(%key, ttl_secs = ttl.as_secs(), "cached"),
            Err(e) => tracing::error!(%key, error = %e, "cache write failed"),
        }
    }
}
