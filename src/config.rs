use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_COINGECKO_URL: &str = "https://api.coingecko.com/api/v3";
const DEFAULT_AI_URL: &str = "https://api.proxyapi.ru/deepseek";
const DEFAULT_AI_MODEL: &str = "deepseek-chat";

// CoinGecko demo tier allows 30 calls/minute.
const DEFAULT_RATE_LIMIT: i64 = 30;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Runtime configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub coingecko_url: String,
    pub coingecko_api_key: String,
    pub ai_url: String,
    pub ai_api_key: String,
    pub ai_model: String,
    pub rate_limit: i64,
    pub rate_limit_window: Duration,
}

impl Config {
    /// Both API keys are required; everything else has defaults.
    pub fn from_env() -> Result<Self, String> {
        let coingecko_api_key =
            env::var("COINGECKO_API_KEY").map_err(|_| "COINGECKO_API_KEY is not set".to_string())?;
        let ai_api_key =
            env::var("OPENAI_API_KEY").map_err(|_| "OPENAI_API_KEY is not set".to_string())?;

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", DEFAULT_BIND_ADDR),
            coingecko_url: env_or("COINGECKO_URL", DEFAULT_COINGECKO_URL),
            coingecko_api_key,
            ai_url: env_or("AI_URL", DEFAULT_AI_URL),
            ai_api_key,
            ai_model: env_or("AI_MODEL", DEFAULT_AI_MODEL),
            rate_limit: env_parse("RATE_LIMIT", DEFAULT_RATE_LIMIT),
            rate_limit_window: Duration::from_secs(env_parse(
                "RATE_LIMIT_WINDOW_SECS",
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )),
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(name, %raw, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}
