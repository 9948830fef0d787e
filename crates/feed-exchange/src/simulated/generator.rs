//! 합성 캔들 생성기.
//!
//! 상한이 있는 random walk로 그럴듯한 OHLCV 바를 만듭니다. 모든 캔들은
//! `source=synthetic`으로 표시됩니다.
//!
//! 한 캔들 안에서 가격은 `open × (1 ± price_volatility)` 범위를 벗어나지 않고,
//! 거래량 변화율은 `volume_volatility` 이내입니다. 가격은 시작 가격의 1/4~4배 범위를 유지합니다.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSource, SeriesKey, SyntheticConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// 가격/거래량 소수 자릿수.
const DECIMAL_PLACES: u32 = 8;

/// 시계열별 마지막 상태.
#[derive(Debug, Clone, Copy)]
struct WalkState {
    close: f64,
    volume: f64,
}

/// 합성 캔들 생성기.
pub struct SyntheticCandleGenerator {
    config: SyntheticConfig,
    rng: StdRng,
    state: HashMap<SeriesKey, WalkState>,
}

impl SyntheticCandleGenerator {
    /// 새 생성기를 생성합니다. `seed`가 있으면 결과가 재현됩니다.
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            state: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// 시계열의 다음 캔들을 생성합니다.
    ///
    /// `open_time`은 타임프레임 경계로 정렬됩니다. 시가는 직전 종가를 이어받습니다.
    pub fn next_candle(&mut self, series: &SeriesKey, open_time: DateTime<Utc>) -> Candle {
        let vol = self.config.price_volatility;
        let vvol = self.config.volume_volatility;
        let base = WalkState {
            close: self.config.base_price,
            volume: self.config.base_volume,
        };
        let prev = *self.state.get(series).unwrap_or(&base);

        let open = prev.close;
        // 가격은 [base/4, base·4] 밴드 안에 머무름
        let floor = self.config.base_price / 4.0;
        let ceiling = self.config.base_price * 4.0;
        let ret = (self.config.trend_bias + self.rng.gen_range(-vol..=vol))
            .clamp(-vol, vol)
            .clamp((floor / open - 1.0).min(0.0), (ceiling / open - 1.0).max(0.0));
        let close = open * (1.0 + ret);

        // 꼬리는 [max(o,c), open·(1+vol)] / [open·(1-vol), min(o,c)] 사이
        let upper = open * (1.0 + vol);
        let lower = open * (1.0 - vol);
        let top = open.max(close);
        let bottom = open.min(close);
        let high = top + (upper - top) * self.rng.gen_range(0.0..=1.0);
        let low = bottom - (bottom - lower) * self.rng.gen_range(0.0..=1.0);

        let volume_change = self.rng.gen_range(-vvol..=vvol);
        let volume = (prev.volume * (1.0 + volume_change)).max(0.0);

        self.state.insert(series.clone(), WalkState { close, volume });

        let open_d = to_decimal(open);
        let close_d = to_decimal(close);
        // 반올림 후에도 high/low 관계 유지
        let high_d = to_decimal(high).max(open_d.max(close_d));
        let low_d = to_decimal(low).min(open_d.min(close_d));

        Candle::new(
            series.symbol.clone(),
            series.timeframe,
            series.timeframe.align(open_time),
            open_d,
            high_d,
            low_d,
            close_d,
            to_decimal(volume),
            CandleSource::Synthetic,
        )
    }

    /// `start`부터 연속된 `count`개의 캔들을 생성합니다.
    pub fn generate_series(
        &mut self,
        series: &SeriesKey,
        start: DateTime<Utc>,
        count: usize,
    ) -> Vec<Candle> {
        let mut open_time = series.timeframe.align(start);
        let mut candles = Vec::with_capacity(count);
        for _ in 0..count {
            candles.push(self.next_candle(series, open_time));
            open_time = series.timeframe.next_open(open_time);
        }
        candles
    }

    /// 시계열의 random walk 상태를 초기화합니다.
    pub fn reset(&mut self, series: &SeriesKey) {
        self.state.remove(series);
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or_default()
        .round_dp(DECIMAL_PLACES)
}
