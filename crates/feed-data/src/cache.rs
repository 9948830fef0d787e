//! 프로세스 내 캔들 캐시.
//!
//! 시계열별 최신 캔들을 보관하고 하위 소비자에게 broadcast 합니다.
//!
//! degraded mode에서는 합성 캔들이 별도 엔트리(`CacheEntry`)로 저장되며 저장소에는
//! 기록되지 않습니다. 같은 시계열에 실데이터가 들어오면 합성 엔트리는 즉시 제거됩니다.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSink, SeriesKey};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// broadcast 채널 버퍼 크기.
const BROADCAST_CAPACITY: usize = 1024;

/// degraded mode 캐시 엔트리.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: SeriesKey,
    pub data: Candle,
    pub generated_at: DateTime<Utc>,
}

/// 캐시 통계.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub real_series: usize,
    pub synthetic_series: usize,
    pub subscribers: usize,
}

#[derive(Default)]
struct CacheInner {
    real: HashMap<SeriesKey, Candle>,
    synthetic: HashMap<SeriesKey, CacheEntry>,
}

/// 캔들 캐시.
pub struct CandleCache {
    inner: RwLock<CacheInner>,
    tx: broadcast::Sender<Candle>,
}

impl Default for CandleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CandleCache {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: RwLock::new(CacheInner::default()),
            tx,
        }
    }

    /// 새 캔들을 반영하고 구독자에게 전달합니다.
    ///
    /// 실데이터는 더 오래된 캔들로 덮어쓰지 않으며, 같은 시계열의 합성 엔트리를 제거합니다.
    pub fn update(&self, candle: Candle) {
        let series = candle.series();
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if candle.source.is_synthetic() {
                inner.synthetic.insert(
                    series.clone(),
                    CacheEntry {
                        key: series,
                        data: candle.clone(),
                        generated_at: Utc::now(),
                    },
                );
            } else {
                if inner.synthetic.remove(&series).is_some() {
                    info!(series = %series, "Real data superseded synthetic cache entry");
                }
                let newer = inner
                    .real
                    .get(&series)
                    .map_or(true, |prev| candle.open_time >= prev.open_time);
                if newer {
                    inner.real.insert(series, candle.clone());
                }
            }
        }

        // 구독자가 없으면 에러지만 무시
        let _ = self.tx.send(candle);
    }

    /// 시계열의 최신 캔들. 합성 엔트리가 있으면 그것을 반환합니다.
    pub fn latest(&self, series: &SeriesKey) -> Option<Candle> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .synthetic
            .get(series)
            .map(|entry| entry.data.clone())
            .or_else(|| inner.real.get(series).cloned())
    }

    /// 시계열의 최신 실데이터 캔들 (신선도 판단용).
    pub fn newest_real(&self, series: &SeriesKey) -> Option<Candle> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .real
            .get(series)
            .cloned()
    }

    /// degraded mode 엔트리 목록.
    pub fn synthetic_entries(&self) -> Vec<CacheEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .synthetic
            .values()
            .cloned()
            .collect()
    }

    /// 모든 합성 엔트리를 제거합니다. 제거된 수를 반환합니다.
    pub fn evict_synthetic(&self) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let evicted = inner.synthetic.len();
        inner.synthetic.clear();
        if evicted > 0 {
            info!(evicted, "Synthetic cache entries evicted");
        }
        evicted
    }

    /// 메모리 압박 완화: 합성 엔트리를 비우고 맵 용량을 줄입니다.
    pub fn shrink(&self) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let evicted = inner.synthetic.len();
        inner.synthetic.clear();
        inner.synthetic.shrink_to_fit();
        inner.real.shrink_to_fit();
        evicted
    }

    /// 캔들 업데이트를 구독합니다.
    pub fn subscribe(&self) -> broadcast::Receiver<Candle> {
        self.tx.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            real_series: inner.real.len(),
            synthetic_series: inner.synthetic.len(),
            subscribers: self.tx.receiver_count(),
        }
    }
}

/// 캐시에만 기록하는 수신자 (degraded mode 스트림용).
///
/// 저장소를 거치지 않으므로 합성 데이터가 영구 기록에 섞이지 않습니다.
pub struct CacheSink {
    cache: Arc<CandleCache>,
}

impl CacheSink {
    pub fn new(cache: Arc<CandleCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CandleSink for CacheSink {
    async fn accept(&self, candle: Candle) {
        if let Err(e) = candle.validate() {
            warn!(key = %candle.key(), error = %e, "Rejected candle at cache sink");
            return;
        }
        self.cache.update(candle);
    }
}
