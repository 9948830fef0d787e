//! 거래소 연결 및 시세 데이터 공급.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - DataSource trait: 실데이터/합성 데이터 공통 인터페이스
//! - Binance kline 스트림 클라이언트 (WebSocket, 자동 재연결)
//! - Binance 과거 캔들 조회기 (REST, 페이지 분할, 재시도)
//! - 합성 캔들 생성기 (degraded mode 전용)
//! - Circuit breaker: 장애 허용을 위한 회로 차단기

pub mod circuit_breaker;
pub mod connector;
pub mod error;
pub mod retry;
pub mod simulated;
pub mod source;
pub mod traits;
pub mod websocket;

pub use circuit_breaker::{
    CategoryThresholds, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    ErrorCategory,
};
pub use connector::{BinanceHistoricalFetcher, FetcherConfig};
pub use error::*;
pub use retry::{with_retry, RetryConfig};
pub use simulated::{SyntheticCandleGenerator, SyntheticDataSource};
pub use source::ExchangeDataSource;
pub use traits::*;
pub use websocket::{BinanceKlineStream, StreamConfig, StreamMessage, SubscriptionHandle};
