// Wire types for validated upstream payloads. Deserializing into these is
// the schema-validation step of the fetch pipeline; anything that decodes
// here is safe to cache and return.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Market listing entry from `/coins/markets`.
///
/// Numeric fields are nullable upstream for freshly listed or delisted
/// coins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coin {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub current_price: Option<f64>,
    pub price_change_percentage_24h: Option<f64>,
    pub image: String,
    pub market_cap_rank: Option<u32>,
    pub market_cap: Option<f64>,
    pub total_volume: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub total_supply: Option<f64>,
    pub max_supply: Option<f64>,
    pub ath: Option<f64>,
    pub atl: Option<f64>,
}

/// Full detail payload from `/coins/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinDetails {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub description: Option<Description>,
    pub image: CoinImage,
    pub market_data: MarketData,
    pub links: Option<CoinLinks>,
    pub genesis_date: Option<String>,
    pub community_data: Option<CommunityData>,
    pub developer_data: Option<DeveloperData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub en: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinImage {
    pub large: String,
    pub small: String,
    pub thumb: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub current_price: UsdValue,
    pub market_cap_rank: u32,
    pub market_cap: UsdValue,
    pub total_volume: UsdValue,
    pub high_24h: UsdValue,
    pub low_24h: UsdValue,
    pub price_change_percentage_24h: Option<f64>,
    pub price_change_percentage_7d: Option<f64>,
    pub price_change_percentage_30d: Option<f64>,
    pub price_change_percentage_1y: Option<f64>,
    pub circulating_supply: f64,
    pub total_supply: Option<f64>,
    pub max_supply: Option<f64>,
    pub ath: UsdValue,
    pub ath_date: UsdDate,
    pub atl: UsdValue,
    pub atl_date: UsdDate,
}

/// CoinGecko reports money amounts per currency; only USD is consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsdValue {
    pub usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsdDate {
    pub usd: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinLinks {
    pub homepage: Vec<String>,
    pub blockchain_site: Vec<String>,
    pub official_forum_url: Vec<String>,
    pub twitter_screen_name: Option<String>,
    pub telegram_channel_identifier: Option<String>,
    pub subreddit_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityData {
    pub twitter_followers: Option<u64>,
    pub reddit_subscribers: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeveloperData {
    pub forks: Option<u64>,
    pub stars: Option<u64>,
    pub subscribers: Option<u64>,
}

/// Price history from `/coins/{id}/market_chart`: `[timestamp_ms, value]`
/// pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketChart {
    pub prices: Vec<(i64, f64)>,
    pub market_caps: Vec<(i64, f64)>,
    pub total_volumes: Vec<(i64, f64)>,
}

/// Analysis window requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl Timeframe {
    /// The `days` query parameter CoinGecko expects for this window.
    pub fn days(self) -> u32 {
        match self {
            Timeframe::Day => 1,
            Timeframe::Week => 7,
            Timeframe::Month => 30,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::Day => "24h",
            Timeframe::Week => "7d",
            Timeframe::Month => "30d",
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Day
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    High,
    Medium,
    Low,
}

/// Model-produced technical analysis of recent price action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceAnalysis {
    pub trend: Trend,
    pub confidence: f64,
    pub support: f64,
    pub resistance: f64,
    pub prediction: Prediction,
    pub technical_indicators: Vec<TechnicalIndicator>,
}

impl PriceAnalysis {
    /// Bounds the model is required to respect; serde cannot express
    /// numeric ranges, so they are checked here after decoding.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence out of range: {}", self.confidence));
        }
        if !(0.0..=1.0).contains(&self.prediction.probability) {
            return Err(format!(
                "prediction probability out of range: {}",
                self.prediction.probability
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub price: f64,
    pub timeframe: String,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalIndicator {
    pub name: String,
    pub value: String,
    pub signal: Signal,
}

/// Model-produced sentiment analysis of project news and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsAnalysis {
    pub sentiment: Sentiment,
    pub score: f64,
    pub summary: String,
    pub key_events: Vec<KeyEvent>,
}

impl NewsAnalysis {
    pub fn validate(&self) -> Result<(), String> {
        if !(-1.0..=1.0).contains(&self.score) {
            return Err(format!("sentiment score out of range: {}", self.score));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub title: String,
    pub impact: Impact,
    pub sentiment: Sentiment,
}

/// Combined analysis returned to callers and cached as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    pub price_analysis: PriceAnalysis,
    pub news_analysis: NewsAnalysis,
}
