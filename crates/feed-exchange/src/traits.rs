//! 데이터 소스 trait 정의.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSink, SeriesKey, Symbol, Timeframe};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::ExchangeError;

/// 거래소 작업을 위한 Result 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// 과거 캔들 범위 조회.
#[async_trait]
pub trait HistoricalDataProvider: Send + Sync {
    /// `open_time`이 `[since, until]`에 속하는 확정 캔들을 시간순으로 반환합니다.
    ///
    /// 범위가 한 페이지를 넘으면 내부에서 페이지를 나눠 조회합니다.
    /// `limit`이 주어지면 최대 그 개수만 반환합니다.
    async fn fetch_range(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: Option<usize>,
    ) -> ExchangeResult<Vec<Candle>>;
}

/// 캔들 공급원.
///
/// 실거래소 구현과 합성 구현이 있으며, 수집기 생성 시 한 번 선택됩니다.
#[async_trait]
pub trait DataSource: HistoricalDataProvider {
    /// 로그/헬스 리포트용 이름.
    fn name(&self) -> &str;

    /// 주어진 시계열을 구독하고 확정 캔들을 `sink`로 전달합니다.
    ///
    /// `shutdown`이 취소되면 `Ok(())`로 반환합니다. 재연결을 소진하는 등
    /// 스트림을 유지할 수 없으면 에러를 반환합니다.
    async fn stream(
        &self,
        series: Vec<SeriesKey>,
        sink: Arc<dyn CandleSink>,
        shutdown: CancellationToken,
    ) -> ExchangeResult<()>;

    /// 스트림 연결 상태 (지원하는 경우).
    fn stream_status(&self) -> Option<StreamStatusSnapshot> {
        None
    }
}

/// 스트림 연결 상태 스냅샷.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStatusSnapshot {
    /// 현재 연결 여부
    pub connected: bool,
    /// 누적 재연결 횟수
    pub reconnects: u64,
    /// 현재 연속 연결 실패 횟수
    pub consecutive_failures: u32,
    /// 전달한 확정 캔들 수
    pub candles_emitted: u64,
    /// 버린 잘못된 메시지 수
    pub malformed_messages: u64,
    /// 마지막 메시지 수신 시각
    pub last_message_at: Option<DateTime<Utc>>,
}
