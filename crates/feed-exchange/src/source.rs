//! 실거래소 데이터 소스.
//!
//! REST 과거 조회기와 kline 스트림 클라이언트를 하나의 [`DataSource`]로 묶습니다.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSink, ExchangeConfig, SeriesKey, Symbol, Timeframe};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connector::{BinanceHistoricalFetcher, FetcherConfig};
use crate::traits::{DataSource, ExchangeResult, HistoricalDataProvider, StreamStatusSnapshot};
use crate::websocket::{BinanceKlineStream, StreamConfig};

/// Binance 기반 실데이터 소스.
pub struct ExchangeDataSource {
    name: String,
    fetcher: BinanceHistoricalFetcher,
    stream: Arc<BinanceKlineStream>,
}

impl ExchangeDataSource {
    /// 조회기와 스트림 클라이언트를 직접 지정해 생성합니다.
    pub fn new(name: impl Into<String>, fetcher: BinanceHistoricalFetcher, stream: BinanceKlineStream) -> Self {
        Self {
            name: name.into(),
            fetcher,
            stream: Arc::new(stream),
        }
    }

    /// 거래소 설정에서 생성합니다.
    pub fn from_config(config: &ExchangeConfig, api_key: Option<SecretString>) -> ExchangeResult<Self> {
        let fetcher = BinanceHistoricalFetcher::new(FetcherConfig::from_exchange(config, api_key))?;
        let stream = BinanceKlineStream::new(StreamConfig::from(config));
        Ok(Self::new(config.name.clone(), fetcher, stream))
    }

    pub fn kline_stream(&self) -> &Arc<BinanceKlineStream> {
        &self.stream
    }
}

#[async_trait]
impl HistoricalDataProvider for ExchangeDataSource {
    async fn fetch_range(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: Option<usize>,
    ) -> ExchangeResult<Vec<Candle>> {
        self.fetcher.fetch_range(symbol, timeframe, since, until, limit).await
    }
}

#[async_trait]
impl DataSource for ExchangeDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        series: Vec<SeriesKey>,
        sink: Arc<dyn CandleSink>,
        shutdown: CancellationToken,
    ) -> ExchangeResult<()> {
        let wanted: BTreeSet<SeriesKey> = series.into_iter().collect();

        // 이전 실행의 구독 중 더 이상 필요 없는 것은 해제
        for active in self.stream.active_series() {
            if !wanted.contains(&active) {
                let handle = self.stream.subscribe(active.symbol, active.timeframe)?;
                self.stream.unsubscribe(&handle);
            }
        }
        for key in &wanted {
            self.stream.subscribe(key.symbol.clone(), key.timeframe)?;
        }

        self.stream.on_candle(sink);
        info!(source = %self.name, series = wanted.len(), "Kline stream starting");
        self.stream.run(shutdown).await
    }

    fn stream_status(&self) -> Option<StreamStatusSnapshot> {
        Some(self.stream.status())
    }
}
