mod ai;
mod cache;
mod coingecko;
mod config;
mod error;
mod rate_limit;
mod schemas;
mod store;

use ai::{AiClient, CoinContext};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use cache::Cache;
use coingecko::CoinGeckoClient;
use config::Config;
use error::ApiError;
use rate_limit::RateLimiter;
use schemas::Timeframe;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use store::{KvStore, MemoryStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RATE_LIMIT_KEY: &str = "coingecko:rate_limit";

/// The listing pages over a fixed top-100 universe.
const TOTAL_COINS: u32 = 100;

#[derive(Clone)]
struct AppState {
    coingecko: Arc<CoinGeckoClient>,
    ai: Arc<AiClient>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinwatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting coinwatch gateway");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    // One shared store per process: the cache and the rate-limit counter
    // live in the same keyspace.
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

    let coingecko = Arc::new(CoinGeckoClient::new(
        config.coingecko_url.clone(),
        config.coingecko_api_key.clone(),
        Cache::new(Arc::clone(&store)),
        RateLimiter::new(
            Arc::clone(&store),
            RATE_LIMIT_KEY,
            config.rate_limit,
            config.rate_limit_window,
        ),
    ));

    let ai = Arc::new(AiClient::new(
        config.ai_url.clone(),
        config.ai_api_key.clone(),
        config.ai_model.clone(),
        Cache::new(Arc::clone(&store)),
        Arc::clone(&coingecko),
    ));

    let state = AppState { coingecko, ai };

    // Build router
    let app = Router::new()
        .route("/coins", get(list_coins))
        .route("/coins/by-ids", get(coins_by_ids))
        .route("/coins/{id}", get(coin_details))
        .route("/coins/{id}/history", get(price_history))
        .route("/coins/{id}/analysis", get(coin_analysis))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listen address");

    tracing::info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_per_page")]
    per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    10
}

async fn list_coins(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let coins = state
        .coingecko
        .market_list(params.page, params.per_page)
        .await?;

    Ok(Json(json!({
        "coins": coins,
        "total_coins": TOTAL_COINS,
    })))
}

#[derive(Deserialize)]
struct IdsParams {
    #[serde(default)]
    ids: String,
}

async fn coins_by_ids(
    State(state): State<AppState>,
    Query(params): Query<IdsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let ids: Vec<String> = params
        .ids
        .split(',')
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();

    let coins = state.coingecko.coins_by_ids(&ids).await?;
    Ok(Json(coins))
}

async fn coin_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state.coingecko.coin_details(&id).await?;
    Ok(Json(details))
}

#[derive(Deserialize)]
struct TimeframeParams {
    #[serde(default)]
    timeframe: Timeframe,
}

async fn price_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TimeframeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let chart = state.coingecko.price_history(&id, params.timeframe).await?;
    Ok(Json(chart))
}

async fn coin_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TimeframeParams>,
) -> Result<impl IntoResponse, ApiError> {
    // The analysis prompts need the coin's current state; this details
    // fetch is itself cached and rate limited.
    let details = state.coingecko.coin_details(&id).await?;
    let context = CoinContext::from(&details);

    let analysis = state.ai.analysis(&id, params.timeframe, &context).await?;
    Ok(Json(analysis))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
