use crate::cache::{self, Cache, Namespace};
use crate::error::ApiError;
use crate::rate_limit::RateLimiter;
use crate::schemas::{Coin, CoinDetails, MarketChart, Timeframe};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

const REQ_TIMEOUT: Duration = Duration::from_secs(10);

/// CoinGecko market-data client.
///
/// Every public operation goes through the same pipeline: cache lookup,
/// rate-limit check, upstream GET, schema validation, cache write, with a
/// stale-cache fallback whenever the quota (local or provider-side) is
/// exhausted.
pub struct CoinGeckoClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache: Cache,
    limiter: RateLimiter,
}

impl CoinGeckoClient {
    pub fn new(base_url: String, api_key: String, cache: Cache, limiter: RateLimiter) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQ_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url,
            api_key,
            cache,
            limiter,
        }
    }

    /// Top coins by market cap, one page at a time.
    pub async fn market_list(&self, page: u32, per_page: u32) -> Result<Vec<Coin>, ApiError> {
        self.fetch_validated(
            "/coins/markets",
            &[
                ("vs_currency", json!("usd")),
                ("order", json!("market_cap_desc")),
                ("per_page", json!(per_page)),
                ("page", json!(page)),
                ("sparkline", json!("false")),
            ],
        )
        .await
    }

    pub async fn coin_details(&self, id: &str) -> Result<CoinDetails, ApiError> {
        let path = format!("/coins/{}", id);
        self.fetch_validated(
            &path,
            &[
                ("localization", json!("false")),
                ("tickers", json!("false")),
                ("market_data", json!("true")),
                ("community_data", json!("true")),
                ("developer_data", json!("true")),
                ("sparkline", json!("false")),
            ],
        )
        .await
    }

    /// Market entries for a specific set of coins, e.g. a favorites list.
    pub async fn coins_by_ids(&self, ids: &[String]) -> Result<Vec<Coin>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.fetch_validated(
            "/coins/markets",
            &[
                ("vs_currency", json!("usd")),
                ("ids", json!(ids.join(","))),
                ("order", json!("market_cap_desc")),
                ("sparkline", json!("false")),
            ],
        )
        .await
    }

    pub async fn price_history(
        &self,
        coin_id: &str,
        timeframe: Timeframe,
    ) -> Result<MarketChart, ApiError> {
        let path = format!("/coins/{}/market_chart", coin_id);
        self.fetch_validated(
            &path,
            &[
                ("vs_currency", json!("usd")),
                ("days", json!(timeframe.days().to_string())),
            ],
        )
        .await
    }

    /// The validated fetch pipeline.
    ///
    /// The cache is re-checked after a rate-limit denial: a concurrent
    /// caller may have populated it while this one was being counted out,
    /// and stale-but-validated data beats a 429 to the caller.
    async fn fetch_validated<T>(&self, path: &str, params: &[(&str, Value)]) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Serialize,
    {
        // The path is part of the logical request identity alongside the
        // query parameters.
        let mut key_params: Vec<(&str, Value)> = vec![("path", json!(path))];
        key_params.extend(params.iter().cloned());

        if let Some(cached) = self.cache.get::<T>(Namespace::CoinGecko, &key_params).await {
            return Ok(cached);
        }

        if !self.limiter.try_acquire().await? {
            if let Some(fallback) = self.cache.get::<T>(Namespace::CoinGecko, &key_params).await {
                return Ok(fallback);
            }
            return Err(ApiError::RateLimited);
        }

        let query: Vec<(&str, String)> = params
            .iter()
            .map(|(name, value)| (*name, render_query_value(value)))
            .collect();

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .header("Accept", "application/json")
            .header("x-cg-demo-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("request failed: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(
                retry_after = ?header_value(&response, "retry-after"),
                limit = ?header_value(&response, "x-ratelimit-limit"),
                remaining = ?header_value(&response, "x-ratelimit-remaining"),
                "CoinGecko reported rate limiting"
            );

            if let Some(fallback) = self.cache.get::<T>(Namespace::CoinGecko, &key_params).await {
                return Ok(fallback);
            }
            return Err(ApiError::RateLimited);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!("HTTP {}: {}", status, body)));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| ApiError::Upstream(format!("failed to read body: {}", e)))?;

        // Schema failures are fatal and never cached: a mismatch means the
        // upstream contract changed, not that the data is merely stale.
        let data: T =
            serde_json::from_str(&raw).map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        self.cache
            .set(
                Namespace::CoinGecko,
                &key_params,
                &data,
                cache::MARKET_DATA_TTL,
            )
            .await;

        Ok(data)
    }
}

fn render_query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
