use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to API callers by the fetch pipeline.
///
/// Cache-store failures never appear here — the pipeline degrades to a
/// cache-less pass-through and logs them instead.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Local quota or provider quota exhausted with no cached fallback.
    /// Recoverable: back off and retry.
    #[error("rate limit exceeded and no cached data available")]
    RateLimited,

    /// Non-2xx status (other than 429) or transport-level failure.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// 2xx response whose body failed schema validation. Indicates
    /// upstream contract drift, not a transient condition.
    #[error("invalid response format from upstream: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RateLimited => "RATE_LIMITED",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) | ApiError::InvalidResponse(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// Rate-limiter store failures are hard failures of the pipeline.
impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Upstream(format!("rate limiter unavailable: {}", e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(code = self.code(), error = %self, "request failed");
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Upstream("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::InvalidResponse("bad shape".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ApiError::RateLimited.code(), "RATE_LIMITED");
        assert_eq!(ApiError::Upstream(String::new()).code(), "UPSTREAM_ERROR");
        assert_eq!(
            ApiError::InvalidResponse(String::new()).code(),
            "INVALID_RESPONSE"
        );
    }

    #[test]
    fn test_store_error_is_a_hard_failure() {
        let err: ApiError = StoreError("connection refused".into()).into();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }
}
