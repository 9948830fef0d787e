//! 캔들 저장소.
//!
//! 저장소는 `(symbol, timeframe, open_time)`을 고유 키로 사용하며,
//! 이미 저장된 캔들은 수정하지 않습니다. 같은 키를 다시 쓰면
//! [`WriteOutcome::Duplicate`]가 반환됩니다.

pub mod memory;
pub mod timescale;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Candle, SeriesKey};
use serde::Serialize;

use crate::error::Result;

pub use memory::MemoryStore;
pub use timescale::TimescaleStore;

/// 쓰기 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// 새로 저장됨
    Inserted,
    /// 같은 키가 이미 있어 무시됨
    Duplicate,
}

/// 캔들 저장소 계약.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// 로그/헬스 리포트용 이름.
    fn name(&self) -> &str;

    /// 캔들을 저장합니다. 같은 키가 이미 있으면 기존 값을 유지합니다.
    async fn write(&self, candle: &Candle) -> Result<WriteOutcome>;

    /// 시계열의 가장 최근 캔들.
    async fn last_candle(&self, series: &SeriesKey) -> Result<Option<Candle>>;

    /// `open_time`이 `[start, end)`인 캔들을 시간순으로 반환합니다.
    async fn range(
        &self,
        series: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// 시계열의 캔들 수.
    async fn count(&self, series: &SeriesKey) -> Result<u64>;

    /// 저장소 연결 상태 확인.
    async fn health_check(&self) -> Result<()>;
}
