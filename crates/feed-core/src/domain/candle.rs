//! OHLCV 캔들 도메인 모델.
//!
//! 캔들은 `(symbol, timeframe, open_time)`으로 유일하게 식별되며,
//! 저장소에 기록된 이후에는 변경되지 않습니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};
use crate::types::{Symbol, Timeframe};

/// 캔들의 데이터 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandleSource {
    /// 실시간 스트림
    Stream,
    /// 콜드 스타트 백필
    Backfill,
    /// 갭 복구
    GapFill,
    /// 합성 데이터 (축퇴 모드 전용)
    Synthetic,
}

impl CandleSource {
    /// 저장소 태그 문자열.
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleSource::Stream => "stream",
            CandleSource::Backfill => "backfill",
            CandleSource::GapFill => "gap-fill",
            CandleSource::Synthetic => "synthetic",
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, CandleSource::Synthetic)
    }
}

impl fmt::Display for CandleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandleSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(CandleSource::Stream),
            "backfill" => Ok(CandleSource::Backfill),
            "gap-fill" => Ok(CandleSource::GapFill),
            "synthetic" => Ok(CandleSource::Synthetic),
            other => Err(CoreError::InvalidSource(other.to_string())),
        }
    }
}

/// 하나의 시계열(심볼 + 타임프레임)을 식별하는 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: Symbol, timeframe: Timeframe) -> Self {
        Self { symbol, timeframe }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// 캔들 고유 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandleKey {
    pub series: SeriesKey,
    pub open_time: DateTime<Utc>,
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.series, self.open_time.timestamp_millis())
    }
}

/// OHLCV 캔들스틱 데이터.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// 거래 심볼
    pub symbol: Symbol,
    /// 타임프레임
    pub timeframe: Timeframe,
    /// 캔들 시작 시간
    pub open_time: DateTime<Utc>,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 종가
    pub close: Decimal,
    /// 거래량 (기준 자산 단위)
    pub volume: Decimal,
    /// 데이터 출처
    pub source: CandleSource,
}

impl Candle {
    /// 새 캔들을 생성합니다.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        timeframe: Timeframe,
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        source: CandleSource,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            open_time,
            open,
            high,
            low,
            close,
            volume,
            source,
        }
    }

    /// 시계열 키.
    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }

    /// 고유 키 `(symbol, timeframe, open_time)`.
    pub fn key(&self) -> CandleKey {
        CandleKey {
            series: self.series(),
            open_time: self.open_time,
        }
    }

    /// 캔들 종료 시각 (다음 캔들 시작 시각).
    pub fn close_time(&self) -> DateTime<Utc> {
        self.timeframe.next_open(self.open_time)
    }

    /// 주어진 시각에 이 캔들이 확정(종료)되었는지 여부.
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        self.close_time() <= now
    }

    /// 출처 태그만 바꾼 사본.
    pub fn with_source(mut self, source: CandleSource) -> Self {
        self.source = source;
        self
    }

    /// 값 범위를 검증합니다.
    ///
    /// 가격은 양수, 거래량은 0 이상이어야 하며 `high ≥ max(open, close)`,
    /// `low ≤ min(open, close)`, `open_time`은 타임프레임 경계에 맞아야 합니다.
    pub fn validate(&self) -> CoreResult<()> {
        let fail = |reason: &str| {
            Err(CoreError::InvalidCandle {
                key: self.key().to_string(),
                reason: reason.to_string(),
            })
        };

        if [self.open, self.high, self.low, self.close]
            .iter()
            .any(|p| *p <= Decimal::ZERO)
        {
            return fail("non-positive price");
        }
        if self.volume < Decimal::ZERO {
            return fail("negative volume");
        }
        if self.high < self.open.max(self.close) {
            return fail("high below open/close");
        }
        if self.low > self.open.min(self.close) {
            return fail("low above open/close");
        }
        if !self.timeframe.is_aligned(self.open_time) {
            return fail("open_time not aligned to timeframe");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle::new(
            Symbol::new("BTC", "USDT"),
            Timeframe::M5,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap(),
            open,
            high,
            low,
            close,
            dec!(12.5),
            CandleSource::Stream,
        )
    }

    #[test]
    fn test_candle_key_and_close_time() {
        let c = candle(dec!(100), dec!(110), dec!(95), dec!(105));
        assert_eq!(c.key().to_string(), "BTC/USDT@5m#1704067500000");
        assert_eq!(
            c.close_time(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap()
        );
        assert!(!c.is_closed_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 9, 59).unwrap()));
        assert!(c.is_closed_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap()));
    }

    #[test]
    fn test_validate_accepts_well_formed_candle() {
        assert!(candle(dec!(100), dec!(110), dec!(95), dec!(105)).validate().is_ok());
        // 도지 캔들
        assert!(candle(dec!(100), dec!(100), dec!(100), dec!(100)).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        assert!(candle(dec!(100), dec!(104), dec!(95), dec!(105)).validate().is_err());
        assert!(candle(dec!(100), dec!(110), dec!(101), dec!(105)).validate().is_err());
        assert!(candle(dec!(0), dec!(110), dec!(0), dec!(105)).validate().is_err());

        let mut negative_volume = candle(dec!(100), dec!(110), dec!(95), dec!(105));
        negative_volume.volume = dec!(-1);
        assert!(negative_volume.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unaligned_open_time() {
        let mut c = candle(dec!(100), dec!(110), dec!(95), dec!(105));
        c.open_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 6, 0).unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_source_tags() {
        assert_eq!(CandleSource::GapFill.to_string(), "gap-fill");
        assert_eq!("synthetic".parse::<CandleSource>().unwrap(), CandleSource::Synthetic);
        assert!("mock".parse::<CandleSource>().is_err());
        assert_eq!(
            serde_json::to_string(&CandleSource::GapFill).unwrap(),
            "\"gap-fill\""
        );
    }

    proptest! {
        #[test]
        fn prop_wicks_around_body_always_validate(
            open in 1u32..1_000_000,
            close in 1u32..1_000_000,
            up in 0u32..10_000,
            down in 0u32..10_000,
        ) {
            let (open, close) = (Decimal::from(open), Decimal::from(close));
            let high = open.max(close) + Decimal::from(up);
            let low = (open.min(close) - Decimal::from(down)).max(dec!(0.0001));
            prop_assert!(candle(open, high, low, close).validate().is_ok());
        }
    }
}
