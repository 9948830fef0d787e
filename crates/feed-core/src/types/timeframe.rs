//! 캔들스틱 데이터를 위한 타임프레임 정의.
//!
//! 타임프레임 라벨과 기간의 정적 매핑을 제공하며, 다음 캔들 경계를
//! 계산하는 데 사용됩니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// 주봉 경계 보정값 (1970-01-05 월요일 00:00 UTC).
const WEEK_OFFSET_SECS: i64 = 4 * 24 * 60 * 60;

/// 캔들스틱 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    /// 1분봉
    M1,
    /// 3분봉
    M3,
    /// 5분봉
    M5,
    /// 15분봉
    M15,
    /// 30분봉
    M30,
    /// 1시간봉
    H1,
    /// 2시간봉
    H2,
    /// 4시간봉
    H4,
    /// 6시간봉
    H6,
    /// 8시간봉
    H8,
    /// 12시간봉
    H12,
    /// 일봉
    D1,
    /// 3일봉
    D3,
    /// 주봉
    W1,
}

impl Timeframe {
    /// 지원하는 모든 타임프레임.
    pub const ALL: [Timeframe; 14] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::D3,
        Timeframe::W1,
    ];

    /// 이 타임프레임의 기간을 반환합니다.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    /// 이 타임프레임의 초 단위 값을 반환합니다.
    pub fn as_secs(&self) -> u64 {
        const MIN: u64 = 60;
        const HOUR: u64 = 60 * MIN;
        const DAY: u64 = 24 * HOUR;

        match self {
            Timeframe::M1 => MIN,
            Timeframe::M3 => 3 * MIN,
            Timeframe::M5 => 5 * MIN,
            Timeframe::M15 => 15 * MIN,
            Timeframe::M30 => 30 * MIN,
            Timeframe::H1 => HOUR,
            Timeframe::H2 => 2 * HOUR,
            Timeframe::H4 => 4 * HOUR,
            Timeframe::H6 => 6 * HOUR,
            Timeframe::H8 => 8 * HOUR,
            Timeframe::H12 => 12 * HOUR,
            Timeframe::D1 => DAY,
            Timeframe::D3 => 3 * DAY,
            Timeframe::W1 => 7 * DAY,
        }
    }

    /// chrono 기간으로 반환합니다.
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.as_secs() as i64)
    }

    /// 밀리초 단위 값을 반환합니다.
    pub fn as_millis(&self) -> i64 {
        self.as_secs() as i64 * 1000
    }

    /// 주어진 시각이 속한 캔들의 시작 시각(경계)으로 내림합니다.
    pub fn align(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.as_secs() as i64;
        let offset = if *self == Timeframe::W1 {
            WEEK_OFFSET_SECS
        } else {
            0
        };
        let floored = (at.timestamp() - offset).div_euclid(step) * step + offset;
        DateTime::from_timestamp(floored, 0).unwrap_or(at)
    }

    /// 시각이 캔들 경계에 정확히 맞는지 확인합니다.
    pub fn is_aligned(&self, at: DateTime<Utc>) -> bool {
        at.timestamp_subsec_nanos() == 0 && self.align(at) == at
    }

    /// 주어진 캔들 다음 캔들의 시작 시각.
    pub fn next_open(&self, open_time: DateTime<Utc>) -> DateTime<Utc> {
        open_time + self.as_chrono()
    }

    /// 바이낸스 간격 문자열로 변환합니다.
    pub fn to_binance_interval(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::D3 => "3d",
            Timeframe::W1 => "1w",
        }
    }

    /// 바이낸스 간격 문자열에서 파싱합니다.
    pub fn from_binance_interval(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|tf| tf.to_binance_interval() == s)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_binance_interval())
    }
}

impl FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_binance_interval(s.trim())
            .ok_or_else(|| CoreError::InvalidTimeframe(s.to_string()))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_binance_interval().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::M1.as_secs(), 60);
        assert_eq!(Timeframe::M5.as_secs(), 300);
        assert_eq!(Timeframe::H1.as_secs(), 3600);
        assert_eq!(Timeframe::D1.as_secs(), 86400);
    }

    #[test]
    fn test_timeframe_binance() {
        assert_eq!(Timeframe::M15.to_binance_interval(), "15m");
        assert_eq!(Timeframe::from_binance_interval("4h"), Some(Timeframe::H4));
        assert_eq!(Timeframe::from_binance_interval("1M"), None);
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_timeframe_serde_uses_label() {
        let json = serde_json::to_string(&Timeframe::M5).unwrap();
        assert_eq!(json, "\"5m\"");
        let parsed: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(parsed, Timeframe::H1);
    }

    #[test]
    fn test_align_five_minutes() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 7, 42).unwrap();
        let aligned = Timeframe::M5.align(at);
        assert_eq!(aligned, Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap());
        assert_eq!(
            Timeframe::M5.next_open(aligned),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 10, 0).unwrap()
        );
    }

    #[test]
    fn test_align_week_starts_monday() {
        // 2024-03-07은 목요일
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 0, 0).unwrap();
        let aligned = Timeframe::W1.align(at);
        assert_eq!(aligned, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
    }

    proptest! {
        #[test]
        fn prop_align_floors_within_one_interval(secs in 0i64..4_000_000_000, idx in 0usize..14) {
            let tf = Timeframe::ALL[idx];
            let at = DateTime::from_timestamp(secs, 0).unwrap();
            let aligned = tf.align(at);
            prop_assert!(aligned <= at);
            prop_assert!(at - aligned < tf.as_chrono());
            prop_assert!(tf.is_aligned(aligned));
        }
    }
}
