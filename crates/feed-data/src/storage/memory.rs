//! 인메모리 캔들 저장소.
//!
//! [`TimescaleStore`](super::TimescaleStore)와 같은 의미(키 고유성, 불변 행)를 가지며
//! 로컬 실행과 테스트에서 사용됩니다.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Candle, SeriesKey};
use tokio::sync::RwLock;

use super::{CandleStore, WriteOutcome};
use crate::error::Result;

/// 인메모리 저장소.
#[derive(Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, Candle>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 시계열의 전체 캔들 (시간순).
    pub async fn snapshot(&self, series: &SeriesKey) -> Vec<Candle> {
        self.series
            .read()
            .await
            .get(series)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 전체 캔들 수.
    pub async fn total(&self) -> usize {
        self.series.read().await.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, candle: &Candle) -> Result<WriteOutcome> {
        let mut guard = self.series.write().await;
        let rows = guard.entry(candle.series()).or_default();
        if rows.contains_key(&candle.open_time) {
            return Ok(WriteOutcome::Duplicate);
        }
        rows.insert(candle.open_time, candle.clone());
        Ok(WriteOutcome::Inserted)
    }

    async fn last_candle(&self, series: &SeriesKey) -> Result<Option<Candle>> {
        Ok(self
            .series
            .read()
            .await
            .get(series)
            .and_then(|rows| rows.values().next_back().cloned()))
    }

    async fn range(
        &self,
        series: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self
            .series
            .read()
            .await
            .get(series)
            .map(|rows| rows.range(start..end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn count(&self, series: &SeriesKey) -> Result<u64> {
        Ok(self
            .series
            .read()
            .await
            .get(series)
            .map_or(0, |rows| rows.len() as u64))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
