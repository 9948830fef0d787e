//! 거래소 에러 타입.

use std::time::Duration;

use thiserror::Error;

/// 거래소 관련 에러.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 거래소 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 인증/권한 에러
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 요청 한도 초과
    #[error("Rate limit exceeded (retry after {retry_after:?})")]
    RateLimited {
        /// 서버가 알려준 대기 시간
        retry_after: Option<Duration>,
    },

    /// 5xx 서버 에러
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// API 에러 코드
    #[error("API error {code}: {message}")]
    ApiError { code: i32, message: String },

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 심볼 인코딩 오류
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// WebSocket 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 재시도 소진 후 과거 데이터 조회 불가
    #[error("Fetch unavailable after {attempts} attempts: {last_error}")]
    FetchUnavailable { attempts: u32, last_error: String },

    /// 스트림 재연결 소진
    #[error("Stream reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// 회로 차단 상태
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::Disconnected(_)
                | ExchangeError::RateLimited { .. }
                | ExchangeError::ServerError { .. }
                | ExchangeError::Timeout(_)
                | ExchangeError::WebSocket(_)
        )
    }

    /// 다음 시도 전 반드시 기다려야 하는 시간.
    ///
    /// rate limit 응답은 즉시 재시도하지 않고 서버가 알려준 시간(없으면
    /// `default_rate_limit_delay`)만큼 대기합니다.
    pub fn cooperative_delay(&self, default_rate_limit_delay: Duration) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after } => {
                Some(retry_after.unwrap_or(default_rate_limit_delay))
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ExchangeError::NetworkError(err.to_string())
        } else if err.is_decode() {
            ExchangeError::ParseError(err.to_string())
        } else {
            ExchangeError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ExchangeError::Disconnected(err.to_string())
            }
            WsError::Io(e) => ExchangeError::NetworkError(e.to_string()),
            other => ExchangeError::WebSocket(other.to_string()),
        }
    }
}
