use crate::cache::{self, Cache, Namespace};
use crate::coingecko::CoinGeckoClient;
use crate::error::ApiError;
use crate::schemas::{AiAnalysis, CoinDetails, MarketChart, NewsAnalysis, PriceAnalysis, Timeframe};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const REQ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOKENS: u32 = 800;
const TEMPERATURE: f32 = 0.3;

/// Everything about a coin the analysis prompts need, extracted from an
/// already-validated details payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinContext {
    pub name: String,
    pub symbol: String,
    pub description: String,
    pub market_cap_rank: u32,
    pub current_price: f64,
    pub market_cap: f64,
    pub total_volume: f64,
    pub price_change_percentage_24h: Option<f64>,
    pub price_change_percentage_7d: Option<f64>,
    pub price_change_percentage_30d: Option<f64>,
}

impl From<&CoinDetails> for CoinContext {
    fn from(details: &CoinDetails) -> Self {
        Self {
            name: details.name.clone(),
            symbol: details.symbol.clone(),
            description: details
                .description
                .as_ref()
                .map(|d| d.en.clone())
                .unwrap_or_default(),
            market_cap_rank: details.market_data.market_cap_rank,
            current_price: details.market_data.current_price.usd,
            market_cap: details.market_data.market_cap.usd,
            total_volume: details.market_data.total_volume.usd,
            price_change_percentage_24h: details.market_data.price_change_percentage_24h,
            price_change_percentage_7d: details.market_data.price_change_percentage_7d,
            price_change_percentage_30d: details.market_data.price_change_percentage_30d,
        }
    }
}

// Chat-completion wire types for an OpenAI-compatible endpoint.

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    type_: &'static str,
}

impl ResponseFormat {
    fn json_object() -> Self {
        Self {
            type_: "json_object",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// LLM analysis client.
///
/// Results are cached for 30 minutes per coin and timeframe; the price
/// history feeding the prompt is fetched through the market client and so
/// shares its cache and rate limit. No local limiter on the chat calls
/// themselves — the analysis cache is the effective throttle.
pub struct AiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    cache: Cache,
    coingecko: Arc<CoinGeckoClient>,
}

impl AiClient {
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        cache: Cache,
        coingecko: Arc<CoinGeckoClient>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQ_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url,
            api_key,
            model,
            cache,
            coingecko,
        }
    }

    /// Combined price and news analysis for a coin over a timeframe.
    pub async fn analysis(
        &self,
        coin_id: &str,
        timeframe: Timeframe,
        context: &CoinContext,
    ) -> Result<AiAnalysis, ApiError> {
        let key_params = [
            ("coinId", json!(coin_id)),
            ("timeframe", json!(timeframe.as_str())),
        ];

        if let Some(cached) = self
            .cache
            .get::<AiAnalysis>(Namespace::AiAnalysis, &key_params)
            .await
        {
            tracing::info!(coin_id, "using cached analysis");
            return Ok(cached);
        }

        let history = self.coingecko.price_history(coin_id, timeframe).await?;

        let (price_analysis, news_analysis) = tokio::try_join!(
            self.analyze_price(&history, timeframe, context),
            self.analyze_news(context),
        )?;

        let result = AiAnalysis {
            price_analysis,
            news_analysis,
        };

        self.cache
            .set(
                Namespace::AiAnalysis,
                &key_params,
                &result,
                cache::AI_ANALYSIS_TTL,
            )
            .await;

        Ok(result)
    }

    async fn analyze_price(
        &self,
        history: &MarketChart,
        timeframe: Timeframe,
        context: &CoinContext,
    ) -> Result<PriceAnalysis, ApiError> {
        tracing::debug!("sending price analysis request");
        let analysis: PriceAnalysis = self
            .chat_json(
                "You are a cryptocurrency market analyst. Analyze the data and return insights in the specified JSON format.",
                &price_prompt(history, timeframe, context),
            )
            .await?;

        analysis.validate().map_err(ApiError::InvalidResponse)?;
        Ok(analysis)
    }

    async fn analyze_news(&self, context: &CoinContext) -> Result<NewsAnalysis, ApiError> {
        tracing::debug!("sending news analysis request");
        let analysis: NewsAnalysis = self
            .chat_json(
                "You are a cryptocurrency news analyst. Analyze the news and return insights in the specified JSON format.",
                &news_prompt(context),
            )
            .await?;

        analysis.validate().map_err(ApiError::InvalidResponse)?;
        Ok(analysis)
    }

    /// One JSON-mode completion round trip: the model's message content is
    /// itself a JSON document that must decode into `T`.
    async fn chat_json<T: DeserializeOwned>(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<T, ApiError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(prompt)],
            response_format: ResponseFormat::json_object(),
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, %body, "AI API request failed");
            return Err(ApiError::Upstream(format!("AI API returned HTTP {}", status)));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        let content = completion
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| ApiError::InvalidResponse("no choices in completion".to_string()))?;

        serde_json::from_str(content).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn format_change(change: Option<f64>) -> String {
    change
        .map(|c| format!("{:.2}%", c))
        .unwrap_or_else(|| "N/A".to_string())
}

fn price_prompt(history: &MarketChart, timeframe: Timeframe, context: &CoinContext) -> String {
    // The model only needs the tail of the series.
    let recent: Vec<String> = history
        .prices
        .iter()
        .rev()
        .take(50)
        .rev()
        .map(|(ts, price)| format!("{}: ${}", format_timestamp(*ts), price))
        .collect();

    let market_cap = history.market_caps.last().map(|(_, v)| *v).unwrap_or(0.0);
    let volume = history.total_volumes.last().map(|(_, v)| *v).unwrap_or(0.0);

    format!(
        r#"You are an experienced cryptocurrency market analyst. Analyze the following cryptocurrency data:

HISTORICAL DATA:
1. Historical Prices (last 50 points):
{prices}

CURRENT STATE:
- Current Price: ${current_price}
- Market Cap: ${market_cap}
- Trading Volume: ${volume}
- Analysis Timeframe: {timeframe}

PRICE CHANGES:
- 24h Change: {change_24h}
- 7d Change: {change_7d}
- 30d Change: {change_30d}

ANALYSIS INSTRUCTIONS:
1. Determine the current trend from price dynamics, trading volumes and market capitalization.
2. Calculate support and resistance levels from historical highs and lows.
3. Analyze technical indicators (RSI, MACD, Bollinger Bands).
4. Make a price prediction for the specified timeframe.

Return the result in the following JSON format:
{{
  "trend": "bullish" | "bearish" | "neutral",
  "confidence": number (0-1),
  "support": number,
  "resistance": number,
  "prediction": {{
    "price": number,
    "timeframe": string,
    "probability": number (0-1)
  }},
  "technicalIndicators": [
    {{
      "name": string,
      "value": string,
      "signal": "buy" | "sell" | "hold"
    }}
  ]
}}"#,
        prices = recent.join("\n"),
        current_price = context.current_price,
        market_cap = market_cap,
        volume = volume,
        timeframe = timeframe,
        change_24h = format_change(context.price_change_percentage_24h),
        change_7d = format_change(context.price_change_percentage_7d),
        change_30d = format_change(context.price_change_percentage_30d),
    )
}

fn news_prompt(context: &CoinContext) -> String {
    format!(
        r#"You are an experienced cryptocurrency news analyst. Analyze the following news and data:

NEWS DATA:
{description}
Metadata: {name} ({symbol})
Market Cap Rank: #{rank}
Market Cap: ${market_cap}
Volume: ${volume}

ANALYSIS INSTRUCTIONS:
1. Evaluate overall news sentiment, its market impact and potential effect on investors.
2. Identify key events and their potential price impact.
3. Create a concise summary covering main trends, risks and growth opportunities.

Return the result in the following JSON format:
{{
  "sentiment": "positive" | "negative" | "neutral",
  "score": number (-1 to 1),
  "summary": string,
  "keyEvents": [
    {{
      "title": string,
      "impact": "high" | "medium" | "low",
      "sentiment": "positive" | "negative" | "neutral"
    }}
  ]
}}"#,
        description = context.description,
        name = context.name,
        symbol = context.symbol.to_uppercase(),
        rank = context.market_cap_rank,
        market_cap = context.market_cap,
        volume = context.total_volume,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiter;
    use crate::store::{KvStore, MemoryStore};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn completion_with(content: &Value) -> Value {
        json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "created": 0,
            "model": "deepseek-chat",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content.to_string()},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30},
        })
    }

    fn price_content(confidence: f64) -> Value {
        json!({
            "trend": "bullish",
            "confidence": confidence,
            "support": 40000.0,
            "resistance": 45000.0,
            "prediction": {"price": 44000.0, "timeframe": "24h", "probability": 0.6},
            "technicalIndicators": [
                {"name": "RSI", "value": "62", "signal": "hold"}
            ],
        })
    }

    fn news_content() -> Value {
        json!({
            "sentiment": "positive",
            "score": 0.4,
            "summary": "Adoption continues to grow.",
            "keyEvents": [
                {"title": "ETF inflows", "impact": "high", "sentiment": "positive"}
            ],
        })
    }

    /// Chat endpoint that answers the price prompt and the news prompt
    /// with canned analyses, counting calls.
    fn chat_router(hits: Arc<AtomicUsize>, confidence: f64) -> Router {
        Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let prompt = body["messages"][1]["content"].as_str().unwrap_or_default();
                    let content = if prompt.contains("HISTORICAL DATA") {
                        price_content(confidence)
                    } else {
                        news_content()
                    };
                    Json(completion_with(&content))
                }
            }),
        )
    }

    fn market_router() -> Router {
        Router::new().route(
            "/coins/{id}/market_chart",
            get(|| async {
                Json(json!({
                    "prices": [[1700000000000i64, 42000.0], [1700000060000i64, 42100.0]],
                    "market_caps": [[1700000000000i64, 8.0e11]],
                    "total_volumes": [[1700000000000i64, 1.0e10]],
                }))
            }),
        )
    }

    fn context() -> CoinContext {
        CoinContext {
            name: "Bitcoin".to_string(),
            symbol: "btc".to_string(),
            description: "The original cryptocurrency.".to_string(),
            market_cap_rank: 1,
            current_price: 42000.0,
            market_cap: 8.0e11,
            total_volume: 1.0e10,
            price_change_percentage_24h: Some(1.2),
            price_change_percentage_7d: None,
            price_change_percentage_30d: None,
        }
    }

    async fn ai_client(chat_url: String, store: Arc<MemoryStore>) -> AiClient {
        let kv: Arc<dyn KvStore> = store;
        let coingecko = Arc::new(CoinGeckoClient::new(
            spawn_upstream(market_router()).await,
            "test-key".to_string(),
            Cache::new(kv.clone()),
            RateLimiter::new(
                kv.clone(),
                "coingecko:rate_limit",
                30,
                Duration::from_secs(60),
            ),
        ));
        AiClient::new(
            chat_url,
            "test-key".to_string(),
            "deepseek-chat".to_string(),
            Cache::new(kv),
            coingecko,
        )
    }

    #[tokio::test]
    async fn test_analysis_combines_price_and_news() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryStore::new());
        let client = ai_client(spawn_upstream(chat_router(hits.clone(), 0.8)).await, store).await;

        let analysis = client
            .analysis("bitcoin", Timeframe::Day, &context())
            .await
            .unwrap();

        assert_eq!(analysis.price_analysis.confidence, 0.8);
        assert_eq!(analysis.news_analysis.score, 0.4);
        // One price call and one news call.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_analysis_is_served_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryStore::new());
        let client = ai_client(spawn_upstream(chat_router(hits.clone(), 0.8)).await, store).await;

        let first = client
            .analysis("bitcoin", Timeframe::Day, &context())
            .await
            .unwrap();
        let second = client
            .analysis("bitcoin", Timeframe::Day, &context())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_invalid() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryStore::new());
        let client = ai_client(spawn_upstream(chat_router(hits, 3.0)).await, store).await;

        let err = client
            .analysis("bitcoin", Timeframe::Day, &context())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_empty_choices_is_invalid() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(json!({
                    "id": "cmpl-1",
                    "object": "chat.completion",
                    "created": 0,
                    "model": "deepseek-chat",
                    "choices": [],
                    "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
                }))
            }),
        );

        let store = Arc::new(MemoryStore::new());
        let client = ai_client(spawn_upstream(router).await, store).await;

        let err = client
            .analysis("bitcoin", Timeframe::Day, &context())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_chat_failure_is_upstream_error() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "model offline") }),
        );

        let store = Arc::new(MemoryStore::new());
        let client = ai_client(spawn_upstream(router).await, store).await;

        let err = client
            .analysis("bitcoin", Timeframe::Day, &context())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
    }
}
