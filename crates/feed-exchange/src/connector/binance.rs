//! Binance 과거 캔들 조회 클라이언트.
//!
//! `/api/v3/klines` REST 엔드포인트를 페이지 단위로 호출해 범위 조회를 구현합니다.
//! 요청 간 최소 간격을 지키고, 일시적 실패는 [`with_retry`] 정책으로 재시도합니다.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSource, ExchangeConfig, Symbol, Timeframe};
use reqwest::{header, Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::{with_retry, RetryConfig};
use crate::traits::{ExchangeResult, HistoricalDataProvider};
use crate::ExchangeError;

const KLINES_ENDPOINT: &str = "/api/v3/klines";

// ============================================================================
// 설정
// ============================================================================

/// 과거 데이터 조회 설정.
///
/// `Debug` 구현은 API 키를 마스킹합니다.
#[derive(Clone)]
pub struct FetcherConfig {
    /// REST 기본 URL
    pub base_url: String,
    /// 요청 타임아웃
    pub request_timeout: Duration,
    /// 한 페이지 최대 캔들 수
    pub page_limit: usize,
    /// 요청 간 최소 간격
    pub min_request_interval: Duration,
    /// 재시도 정책
    pub retry: RetryConfig,
    /// 심볼 인코딩 검증용 호가 자산
    pub quote_assets: Vec<String>,
    /// API 키 (공개 엔드포인트라 선택)
    pub api_key: Option<SecretString>,
}

impl fmt::Debug for FetcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherConfig")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("page_limit", &self.page_limit)
            .field("min_request_interval", &self.min_request_interval)
            .field("retry", &self.retry)
            .field("api_key", &self.api_key.as_ref().map(|_| "***REDACTED***"))
            .finish()
    }
}

impl FetcherConfig {
    /// 거래소 설정에서 생성합니다.
    pub fn from_exchange(config: &ExchangeConfig, api_key: Option<SecretString>) -> Self {
        Self {
            base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            page_limit: config.page_limit.clamp(1, 1000),
            min_request_interval: config.min_request_interval(),
            retry: RetryConfig::from(config),
            quote_assets: config.quote_assets.clone(),
            api_key,
        }
    }
}

// ============================================================================
// 응답 타입
// ============================================================================

/// Binance kline 배열 행.
///
/// `[open_time, open, high, low, close, volume, close_time, ...]`
#[derive(Debug, Deserialize)]
struct BinanceKline(
    i64,
    String,
    String,
    String,
    String,
    String,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

/// Binance 에러 응답.
#[derive(Debug, Deserialize)]
struct BinanceError {
    code: i32,
    msg: String,
}

// ============================================================================
// 클라이언트
// ============================================================================

/// Binance 과거 캔들 조회기.
pub struct BinanceHistoricalFetcher {
    client: Client,
    config: FetcherConfig,
    last_request: Mutex<Option<Instant>>,
}

impl BinanceHistoricalFetcher {
    /// 새 조회기를 생성합니다.
    pub fn new(config: FetcherConfig) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            config,
            last_request: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// 요청 간 최소 간격을 보장합니다.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.min_request_interval {
                tokio::time::sleep(self.config.min_request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// 한 페이지를 조회합니다 (재시도 없음).
    async fn fetch_page_once(
        &self,
        exchange_symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> ExchangeResult<Vec<BinanceKline>> {
        self.pace().await;

        let url = format!("{}{}", self.config.base_url, KLINES_ENDPOINT);
        let mut request = self.client.get(&url).query(&[
            ("symbol", exchange_symbol.to_string()),
            ("interval", timeframe.to_binance_interval().to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", self.config.page_limit.to_string()),
        ]);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-MBX-APIKEY", key.expose_secret());
        }

        debug!(symbol = exchange_symbol, %timeframe, start_ms, end_ms, "GET {}", KLINES_ENDPOINT);
        let response = request.send().await?;
        handle_response(response).await
    }

    /// 행을 캔들로 변환합니다. 잘못된 행은 `Err`.
    fn row_to_candle(
        &self,
        row: &BinanceKline,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> ExchangeResult<Candle> {
        let open_time = DateTime::from_timestamp_millis(row.0)
            .ok_or_else(|| ExchangeError::ParseError(format!("bad open time: {}", row.0)))?;

        let candle = Candle::new(
            symbol.clone(),
            timeframe,
            open_time,
            parse_decimal("open", &row.1)?,
            parse_decimal("high", &row.2)?,
            parse_decimal("low", &row.3)?,
            parse_decimal("close", &row.4)?,
            parse_decimal("volume", &row.5)?,
            CandleSource::Backfill,
        );
        candle
            .validate()
            .map_err(|e| ExchangeError::ParseError(e.to_string()))?;
        Ok(candle)
    }
}

#[async_trait]
impl HistoricalDataProvider for BinanceHistoricalFetcher {
    async fn fetch_range(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: Option<usize>,
    ) -> ExchangeResult<Vec<Candle>> {
        let quotes: Vec<&str> = self.config.quote_assets.iter().map(String::as_str).collect();
        let exchange_symbol = symbol.to_exchange_format();
        if Symbol::from_exchange_format(&exchange_symbol, &quotes).as_ref() != Some(symbol) {
            return Err(ExchangeError::InvalidSymbol(symbol.to_string()));
        }
        if since > until {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let end_ms = until.timestamp_millis();
        let mut cursor = since.timestamp_millis();
        let mut candles: Vec<Candle> = Vec::new();
        let mut pages = 0u32;
        let mut rejected = 0u64;

        loop {
            let operation = format!("klines {} {} @{}", exchange_symbol, timeframe, cursor);
            let rows = with_retry(&self.config.retry, &operation, || {
                self.fetch_page_once(&exchange_symbol, timeframe, cursor, end_ms)
            })
            .await?;
            pages += 1;

            let page_len = rows.len();
            let mut last_open_ms = None;
            for row in &rows {
                last_open_ms = Some(row.0);
                match self.row_to_candle(row, symbol, timeframe) {
                    Ok(candle) if candle.open_time < since || candle.open_time > until => {}
                    // 아직 진행 중인 캔들은 제외
                    Ok(candle) if !candle.is_closed_at(now) => {}
                    Ok(candle) => candles.push(candle),
                    Err(e) => {
                        rejected += 1;
                        warn!(symbol = %symbol, %timeframe, error = %e, "Discarding malformed kline row");
                    }
                }
            }

            if limit.is_some_and(|max| candles.len() >= max) {
                break;
            }
            let Some(last_open_ms) = last_open_ms else {
                break;
            };
            if page_len < self.config.page_limit {
                break;
            }
            let next = last_open_ms + timeframe.as_millis();
            if next > end_ms || next <= cursor {
                break;
            }
            cursor = next;
        }

        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        if let Some(max) = limit {
            candles.truncate(max);
        }

        info!(
            symbol = %symbol,
            %timeframe,
            since = %since,
            until = %until,
            pages,
            count = candles.len(),
            rejected,
            "Fetched historical range"
        );
        Ok(candles)
    }
}

/// HTTP 응답을 처리하고 상태 코드를 에러로 매핑합니다.
async fn handle_response<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> ExchangeResult<T> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| ExchangeError::ParseError(e.to_string()));
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
        return Err(ExchangeError::RateLimited { retry_after });
    }
    if status.is_server_error() {
        return Err(ExchangeError::ServerError {
            status: status.as_u16(),
            message: body,
        });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ExchangeError::Unauthorized(body));
    }

    match serde_json::from_str::<BinanceError>(&body) {
        Ok(error) => Err(map_error_code(error.code, &error.msg)),
        Err(_) => Err(ExchangeError::ApiError {
            code: status.as_u16() as i32,
            message: body,
        }),
    }
}

/// Binance 에러 코드를 ExchangeError로 매핑.
fn map_error_code(code: i32, msg: &str) -> ExchangeError {
    match code {
        -1001 => ExchangeError::Disconnected(msg.to_string()),
        -1003 => ExchangeError::RateLimited { retry_after: None },
        -1002 | -2014 | -2015 => ExchangeError::Unauthorized(msg.to_string()),
        -1121 => ExchangeError::InvalidSymbol(msg.to_string()),
        _ => ExchangeError::ApiError {
            code,
            message: msg.to_string(),
        },
    }
}

fn parse_decimal(field: &str, raw: &str) -> ExchangeResult<Decimal> {
    raw.parse()
        .map_err(|_| ExchangeError::ParseError(format!("invalid {}: {:?}", field, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use feed_core::DEFAULT_QUOTE_ASSETS;
    use mockito::Matcher;
    use rust_decimal_macros::dec;

    fn test_config(base_url: String, page_limit: usize) -> FetcherConfig {
        FetcherConfig {
            base_url,
            request_timeout: Duration::from_secs(5),
            page_limit,
            min_request_interval: Duration::ZERO,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 5,
                max_delay_ms: 20,
                multiplier: 2.0,
                jitter: false,
                attempt_timeout_ms: 5_000,
                rate_limit_delay_ms: 10,
            },
            quote_assets: DEFAULT_QUOTE_ASSETS.iter().map(|q| q.to_string()).collect(),
            api_key: None,
        }
    }

    fn row(open_ms: i64, interval_ms: i64) -> serde_json::Value {
        serde_json::json!([
            open_ms, "100.0", "110.0", "95.0", "105.0", "3.5",
            open_ms + interval_ms - 1, "367.5", 42, "1.0", "105.0", "0"
        ])
    }

    fn rows(start_ms: i64, count: i64, interval_ms: i64) -> String {
        serde_json::Value::Array((0..count).map(|i| row(start_ms + i * interval_ms, interval_ms)).collect())
            .to_string()
    }

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_single_page_range() {
        let mut server = mockito::Server::new_async().await;
        let interval = Timeframe::M5.as_millis();
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "5m".into()),
            ]))
            .with_status(200)
            .with_body(rows(t0().timestamp_millis(), 3, interval))
            .expect(1)
            .create_async()
            .await;

        let fetcher = BinanceHistoricalFetcher::new(test_config(server.url(), 1000)).unwrap();
        let candles = fetcher
            .fetch_range(&btc(), Timeframe::M5, t0(), t0() + ChronoDuration::minutes(10), None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].open_time, t0());
        assert_eq!(candles[2].open_time, t0() + ChronoDuration::minutes(10));
        assert_eq!(candles[0].close, dec!(105.0));
        assert!(candles.iter().all(|c| c.source == CandleSource::Backfill));
    }

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let mut server = mockito::Server::new_async().await;
        let interval = Timeframe::M1.as_millis();
        let start = t0().timestamp_millis();

        let first = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::UrlEncoded("startTime".into(), start.to_string()))
            .with_status(200)
            .with_body(rows(start, 2, interval))
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::UrlEncoded("startTime".into(), (start + 2 * interval).to_string()))
            .with_status(200)
            .with_body(rows(start + 2 * interval, 1, interval))
            .expect(1)
            .create_async()
            .await;

        let fetcher = BinanceHistoricalFetcher::new(test_config(server.url(), 2)).unwrap();
        let candles = fetcher
            .fetch_range(&btc(), Timeframe::M1, t0(), t0() + ChronoDuration::minutes(5), None)
            .await
            .unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(candles.len(), 3);
        assert!(candles.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[tokio::test]
    async fn test_retries_server_error_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(rows(t0().timestamp_millis(), 1, Timeframe::M1.as_millis()))
            .expect(1)
            .create_async()
            .await;

        let fetcher = BinanceHistoricalFetcher::new(test_config(server.url(), 1000)).unwrap();
        let candles = fetcher
            .fetch_range(&btc(), Timeframe::M1, t0(), t0(), None)
            .await
            .unwrap();

        failing.assert_async().await;
        ok.assert_async().await;
        assert_eq!(candles.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_fetch_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("Retry-After", "0")
            .expect(3)
            .create_async()
            .await;

        let fetcher = BinanceHistoricalFetcher::new(test_config(server.url(), 1000)).unwrap();
        let result = fetcher
            .fetch_range(&btc(), Timeframe::M1, t0(), t0() + ChronoDuration::hours(1), None)
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ExchangeError::FetchUnavailable { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_api_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .expect(1)
            .create_async()
            .await;

        let fetcher = BinanceHistoricalFetcher::new(test_config(server.url(), 1000)).unwrap();
        let result = fetcher
            .fetch_range(&btc(), Timeframe::M1, t0(), t0(), None)
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ExchangeError::InvalidSymbol(_))));
    }

    #[tokio::test]
    async fn test_malformed_rows_and_open_candle_are_dropped() {
        let mut server = mockito::Server::new_async().await;
        let interval = Timeframe::M1.as_millis();
        // 다음 분 캔들은 어떤 경우에도 아직 확정되지 않음
        let now_open = Timeframe::M1.align(Utc::now()).timestamp_millis() + interval;
        let prev_open = now_open - 3 * interval;

        let mut bad = row(prev_open - interval, interval);
        bad[2] = serde_json::json!("not-a-number");
        let body = serde_json::json!([bad, row(prev_open, interval), row(now_open, interval)]).to_string();

        server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let fetcher = BinanceHistoricalFetcher::new(test_config(server.url(), 1000)).unwrap();
        let since = DateTime::from_timestamp_millis(prev_open - interval).unwrap();
        let until = DateTime::from_timestamp_millis(now_open).unwrap();
        let candles = fetcher
            .fetch_range(&btc(), Timeframe::M1, since, until, None)
            .await
            .unwrap();

        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open_time.timestamp_millis(), prev_open);
    }

    #[tokio::test]
    async fn test_limit_truncates_result() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(rows(t0().timestamp_millis(), 5, Timeframe::M1.as_millis()))
            .create_async()
            .await;

        let fetcher = BinanceHistoricalFetcher::new(test_config(server.url(), 1000)).unwrap();
        let candles = fetcher
            .fetch_range(&btc(), Timeframe::M1, t0(), t0() + ChronoDuration::minutes(4), Some(2))
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_quote_rejected_before_request() {
        let fetcher = BinanceHistoricalFetcher::new(test_config("http://127.0.0.1:9".into(), 1000)).unwrap();
        let result = fetcher
            .fetch_range(&Symbol::new("BTC", "XYZ"), Timeframe::M1, t0(), t0(), None)
            .await;
        assert!(matches!(result, Err(ExchangeError::InvalidSymbol(_))));
    }

    #[test]
    fn test_debug_masks_api_key() {
        let mut config = test_config("http://localhost".into(), 1000);
        config.api_key = Some(SecretString::from("super-secret-key".to_string()));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret-key"));
        assert!(debug.contains("REDACTED"));
    }
}
