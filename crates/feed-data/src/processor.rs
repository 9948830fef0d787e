//! 캔들 수집 처리기.
//!
//! 스트림과 과거 조회에서 들어온 캔들을 bounded 큐로 받아 단일 consumer가 저장소에
//! 기록합니다.
//!
//! - 큐가 가득 차면 `enqueue`는 공간이 생길 때까지 대기합니다 (backpressure).
//! - 검증에 실패한 캔들은 큐에 들어가지 않습니다.
//! - 최근 키 window로 중복을 걸러내고, 저장소도 키 중복을 무시하므로 쓰기는 멱등입니다.
//! - 저장 실패는 제한된 횟수만 재시도하며, 소진되면 해당 캔들을 버리고 통계에 남깁니다.
//!   consumer는 멈추지 않습니다.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use feed_core::{Candle, CandleKey, CandleSink, ProcessorConfig};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::CandleCache;
use crate::error::{DataError, Result};
use crate::storage::{CandleStore, WriteOutcome};

/// 추가 필터 (false면 거부).
pub type CandleFilter = Arc<dyn Fn(&Candle) -> bool + Send + Sync>;

/// 처리기 통계 스냅샷.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    /// 큐에 들어간 캔들 수
    pub enqueued: u64,
    /// 새로 저장된 캔들 수
    pub written: u64,
    /// 중복으로 건너뛴 캔들 수
    pub duplicates: u64,
    /// 검증/필터에서 거부된 캔들 수
    pub rejected: u64,
    /// 재시도 소진으로 버린 캔들 수
    pub write_failures: u64,
    /// 현재 연속 저장 실패 수
    pub consecutive_write_failures: u64,
    /// 종료 시 처리하지 못하고 버린 캔들 수
    pub dropped_on_shutdown: u64,
    /// 현재 대기 중인 캔들 수
    pub pending: usize,
    /// 마지막 저장 에러
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    write_failures: AtomicU64,
    consecutive_write_failures: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// 최근 처리한 키의 bounded window.
struct DedupWindow {
    capacity: usize,
    order: VecDeque<CandleKey>,
    seen: HashSet<CandleKey>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, key: &CandleKey) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: CandleKey) {
        if self.capacity == 0 || !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    fn clear(&mut self) -> usize {
        let n = self.order.len();
        self.order = VecDeque::new();
        self.seen = HashSet::new();
        n
    }
}

/// 대기 카운트를 보장하는 RAII 가드.
///
/// enqueue가 중간에 취소되면 drop 시점에 카운트를 되돌립니다.
struct PendingGuard {
    pending: Arc<watch::Sender<usize>>,
    armed: bool,
}

impl PendingGuard {
    fn acquire(pending: &Arc<watch::Sender<usize>>) -> Self {
        pending.send_modify(|n| *n += 1);
        Self {
            pending: pending.clone(),
            armed: true,
        }
    }

    /// 큐에 들어갔으므로 consumer가 카운트를 책임짐.
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

/// 공유 상태 (consumer 태스크와 공유).
struct Shared {
    store: Arc<dyn CandleStore>,
    cache: Option<Arc<CandleCache>>,
    config: ProcessorConfig,
    counters: Counters,
    pending: Arc<watch::Sender<usize>>,
    dedup: Mutex<DedupWindow>,
}

/// 수집 처리기.
pub struct IngestionProcessor {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<Candle>>>,
    closed: AtomicBool,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    filter: Option<CandleFilter>,
}

impl IngestionProcessor {
    /// 처리기를 생성하고 consumer 태스크를 시작합니다.
    pub fn new(
        store: Arc<dyn CandleStore>,
        cache: Option<Arc<CandleCache>>,
        config: ProcessorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (pending, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            store,
            cache,
            dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
            config,
            counters: Counters::default(),
            pending: Arc::new(pending),
        });
        let consumer = tokio::spawn(consume(shared.clone(), rx));

        info!(
            store = shared.store.name(),
            capacity = shared.config.queue_capacity,
            "Ingestion processor started"
        );

        Self {
            shared,
            sender: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            consumer: tokio::sync::Mutex::new(Some(consumer)),
            filter: None,
        }
    }

    /// 추가 필터를 설정합니다.
    pub fn with_filter(mut self, filter: CandleFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// 캔들을 큐에 넣습니다.
    ///
    /// 큐가 가득 차면 대기합니다. 검증/필터에서 거부되면 `InvalidData`,
    /// 종료 이후에는 `QueueClosed`를 반환합니다.
    pub async fn enqueue(&self, candle: Candle) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DataError::QueueClosed);
        }
        self.check(&candle)?;

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DataError::QueueClosed)?;

        let guard = PendingGuard::acquire(&self.shared.pending);
        sender.send(candle).await.map_err(|_| DataError::QueueClosed)?;
        guard.commit();
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn check(&self, candle: &Candle) -> Result<()> {
        let rejected = if candle.source.is_synthetic() {
            Some("synthetic candles are never persisted".to_string())
        } else if let Err(e) = candle.validate() {
            Some(e.to_string())
        } else if self.filter.as_ref().is_some_and(|f| !f(candle)) {
            Some("rejected by filter".to_string())
        } else {
            None
        };

        match rejected {
            Some(reason) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(key = %candle.key(), source = %candle.source, reason = %reason, "Candle rejected");
                Err(DataError::InvalidData(reason))
            }
            None => Ok(()),
        }
    }

    /// 대기 중인 캔들 수.
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }

    /// 큐가 빌 때까지 최대 `timeout` 동안 기다립니다. 비었으면 `true`.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.pending.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        drained
    }

    /// consumer가 살아 있고 새 작업을 받는지 여부.
    pub async fn is_running(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.consumer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 메모리 압박 완화용: 중복 제거 window를 비웁니다.
    pub fn clear_dedup_window(&self) -> usize {
        let cleared = self
            .shared
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(cleared, "Dedup window cleared");
        cleared
    }

    pub fn stats(&self) -> ProcessorStats {
        let c = &self.shared.counters;
        ProcessorStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            consecutive_write_failures: c.consecutive_write_failures.load(Ordering::Relaxed),
            dropped_on_shutdown: c.dropped_on_shutdown.load(Ordering::Relaxed),
            pending: self.pending(),
            last_error: c
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// 처리기를 종료합니다.
    ///
    /// 새 작업을 거부하고 `grace` 동안 남은 큐를 비웁니다. 유예 시간을 넘기면
    /// 남은 캔들은 버립니다. 모두 처리했으면 `true`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.pending() == 0;
        }
        // sender를 버려야 consumer가 채널 끝을 봄
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut handle) = self.consumer.lock().await.take() else {
            return self.pending() == 0;
        };

        let drained = match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    pending = self.pending(),
                    "Shutdown grace exceeded, dropping remaining candles"
                );
                handle.abort();
                let _ = handle.await;
                let dropped = self.shared.pending.send_replace(0);
                self.shared
                    .counters
                    .dropped_on_shutdown
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                false
            }
        };

        let stats = self.stats();
        info!(
            written = stats.written,
            duplicates = stats.duplicates,
            rejected = stats.rejected,
            write_failures = stats.write_failures,
            dropped = stats.dropped_on_shutdown,
            "Ingestion processor stopped"
        );
        drained
    }
}

#[async_trait]
impl CandleSink for IngestionProcessor {
    async fn accept(&self, candle: Candle) {
        match self.enqueue(candle).await {
            Ok(()) => {}
            Err(DataError::QueueClosed) => debug!("Candle dropped, processor is shut down"),
            // 거부 사유는 check()에서 이미 기록됨
            Err(DataError::InvalidData(_)) => {}
            Err(e) => warn!(error = %e, "Failed to enqueue candle"),
        }
    }
}

// ============================================================================
// consumer
// ============================================================================

/// 모든 sender가 사라질 때까지 큐를 처리합니다.
async fn consume(shared: Arc<Shared>, mut rx: mpsc::Receiver<Candle>) {
    while let Some(candle) = rx.recv().await {
        process(&shared, candle).await;
        shared.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn process(shared: &Shared, candle: Candle) {
    let key = candle.key();
    let counters = &shared.counters;

    let seen = shared
        .dedup
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&key);
    if seen {
        counters.duplicates.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Duplicate candle skipped");
        return;
    }

    let retries = shared.config.write_retries;
    let mut attempt = 0u32;
    let outcome = loop {
        match shared.store.write(&candle).await {
            Ok(outcome) => break Ok(outcome),
            Err(e) if e.is_transient() && attempt < retries => {
                let delay = shared.config.write_retry_delay() * 2u32.saturating_pow(attempt);
                warn!(key = %key, attempt = attempt + 1, error = %e, "Store write failed, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(outcome) => {
            counters.consecutive_write_failures.store(0, Ordering::Relaxed);
            shared
                .dedup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key);
            match outcome {
                WriteOutcome::Inserted => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                    if let Some(cache) = &shared.cache {
                        cache.update(candle);
                    }
                }
                WriteOutcome::Duplicate => {
                    counters.duplicates.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Err(e) => {
            counters.write_failures.fetch_add(1, Ordering::Relaxed);
            counters
                .consecutive_write_failures
                .fetch_add(1, Ordering::Relaxed);
            *counters
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            error!(key = %key, attempts = attempt + 1, error = %e, "Dropping candle after write failures");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::{DateTime, TimeZone, Utc};
    use feed_core::{CandleSource, SeriesKey, Symbol, Timeframe};
    use rust_decimal_macros::dec;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    fn candle(minute: i64) -> Candle {
        Candle::new(
            Symbol::new("BTC", "USDT"),
            Timeframe::M1,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minute),
            dec!(100),
            dec!(110),
            dec!(95),
            dec!(105),
            dec!(2),
            CandleSource::Stream,
        )
    }

    fn config(capacity: usize) -> ProcessorConfig {
        ProcessorConfig {
            queue_capacity: capacity,
            write_retries: 2,
            write_retry_delay_ms: 1,
            dedup_window: 100,
            shutdown_grace_secs: 1,
        }
    }

    /// 허가가 있어야 쓰기가 진행되는 저장소.
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
    }

    #[async_trait]
    impl CandleStore for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }
        async fn write(&self, candle: &Candle) -> Result<WriteOutcome> {
            self.gate.acquire().await.unwrap().forget();
            self.inner.write(candle).await
        }
        async fn last_candle(&self, series: &SeriesKey) -> Result<Option<Candle>> {
            self.inner.last_candle(series).await
        }
        async fn range(&self, s: &SeriesKey, a: DateTime<Utc>, b: DateTime<Utc>) -> Result<Vec<Candle>> {
            self.inner.range(s, a, b).await
        }
        async fn count(&self, series: &SeriesKey) -> Result<u64> {
            self.inner.count(series).await
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    /// 처음 `failures`번 쓰기가 실패하는 저장소.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl CandleStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn write(&self, candle: &Candle) -> Result<WriteOutcome> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DataError::ConnectionError("connection reset".into()));
            }
            self.inner.write(candle).await
        }
        async fn last_candle(&self, series: &SeriesKey) -> Result<Option<Candle>> {
            self.inner.last_candle(series).await
        }
        async fn range(&self, s: &SeriesKey, a: DateTime<Utc>, b: DateTime<Utc>) -> Result<Vec<Candle>> {
            self.inner.range(s, a, b).await
        }
        async fn count(&self, series: &SeriesKey) -> Result<u64> {
            self.inner.count(series).await
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_and_idempotence() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CandleCache::new());
        let processor = IngestionProcessor::new(store.clone(), Some(cache.clone()), config(16));

        for minute in [0, 1, 1, 2, 0] {
            processor.enqueue(candle(minute)).await.unwrap();
        }
        assert!(processor.wait_empty(Duration::from_secs(5)).await);

        let series = candle(0).series();
        assert_eq!(store.count(&series).await.unwrap(), 3);
        let stats = processor.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.written, 3);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(cache.newest_real(&series).unwrap().open_time, candle(2).open_time);
    }

    #[tokio::test]
    async fn test_invalid_and_synthetic_candles_are_never_enqueued() {
        let store = Arc::new(MemoryStore::new());
        let processor = IngestionProcessor::new(store.clone(), None, config(4));

        let mut bad = candle(0);
        bad.low = dec!(200);
        assert!(matches!(processor.enqueue(bad).await, Err(DataError::InvalidData(_))));

        let synthetic = candle(1).with_source(CandleSource::Synthetic);
        assert!(processor.enqueue(synthetic).await.is_err());

        assert!(processor.wait_empty(Duration::from_secs(1)).await);
        assert_eq!(store.total().await, 0);
        assert_eq!(processor.stats().rejected, 2);
        assert_eq!(processor.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_filter_rejects() {
        let store = Arc::new(MemoryStore::new());
        let processor = IngestionProcessor::new(store.clone(), None, config(4))
            .with_filter(Arc::new(|c: &Candle| c.volume > dec!(10)));
        assert!(processor.enqueue(candle(0)).await.is_err());
        assert_eq!(processor.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_backpressure_blocks_producer() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: Semaphore::new(0),
        });
        let processor = Arc::new(IngestionProcessor::new(store.clone(), None, config(1)));

        // consumer가 1개를 잡고 있고 큐에 1개 → 세 번째는 대기
        processor.enqueue(candle(0)).await.unwrap();
        processor.enqueue(candle(1)).await.unwrap();
        let blocked = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.enqueue(candle(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert!(!processor.wait_empty(Duration::from_millis(20)).await);

        store.gate.add_permits(3);
        blocked.await.unwrap().unwrap();
        assert!(processor.wait_empty(Duration::from_secs(5)).await);
        assert_eq!(store.inner.total().await, 3);
    }

    #[tokio::test]
    async fn test_cancelled_enqueue_does_not_leak_pending() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: Semaphore::new(0),
        });
        let processor = Arc::new(IngestionProcessor::new(store.clone(), None, config(1)));
        processor.enqueue(candle(0)).await.unwrap();
        processor.enqueue(candle(1)).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(30), processor.enqueue(candle(2))).await;
        assert!(result.is_err());
        assert_eq!(processor.pending(), 2);

        store.gate.add_permits(2);
        assert!(processor.wait_empty(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_transient_write_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        });
        let processor = IngestionProcessor::new(store.clone(), None, config(4));
        processor.enqueue(candle(0)).await.unwrap();
        assert!(processor.wait_empty(Duration::from_secs(5)).await);

        let stats = processor.stats();
        assert_eq!(stats.written, 1);
        assert_eq!(stats.write_failures, 0);
    }

    #[tokio::test]
    async fn test_exhausted_write_drops_candle_and_keeps_running() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(3),
        });
        let processor = IngestionProcessor::new(store.clone(), None, config(4));
        processor.enqueue(candle(0)).await.unwrap();
        processor.enqueue(candle(1)).await.unwrap();
        assert!(processor.wait_empty(Duration::from_secs(5)).await);

        let stats = processor.stats();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.consecutive_write_failures, 0);
        assert!(stats.last_error.unwrap().contains("connection reset"));
        assert!(processor.is_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let store = Arc::new(MemoryStore::new());
        let processor = IngestionProcessor::new(store.clone(), None, config(16));
        for minute in 0..5 {
            processor.enqueue(candle(minute)).await.unwrap();
        }

        assert!(processor.shutdown(Duration::from_secs(5)).await);
        assert_eq!(store.total().await, 5);
        assert!(matches!(processor.enqueue(candle(9)).await, Err(DataError::QueueClosed)));
        assert!(!processor.is_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_grace_exceeded_drops_remaining() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: Semaphore::new(0),
        });
        let processor = IngestionProcessor::new(store.clone(), None, config(8));
        for minute in 0..3 {
            processor.enqueue(candle(minute)).await.unwrap();
        }

        let drain = tokio::spawn({
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.gate.add_permits(1);
            }
        });
        assert!(!processor.shutdown(Duration::from_millis(200)).await);
        drain.await.unwrap();

        let stats = processor.stats();
        assert_eq!(stats.pending, 0);
        assert!(stats.dropped_on_shutdown >= 1);
    }

    #[test]
    fn test_dedup_window_is_bounded() {
        let mut window = DedupWindow::new(2);
        for minute in 0..3 {
            window.insert(candle(minute).key());
        }
        assert!(!window.contains(&candle(0).key()));
        assert!(window.contains(&candle(2).key()));
        assert_eq!(window.clear(), 2);
    }

    proptest! {
        #[test]
        fn prop_dedup_window_keeps_latest_keys(capacity in 1usize..64, minutes in prop::collection::vec(0i64..200, 0..300)) {
            let mut window = DedupWindow::new(capacity);
            for minute in &minutes {
                window.insert(candle(*minute).key());
            }
            prop_assert!(window.order.len() <= capacity);
            prop_assert_eq!(window.order.len(), window.seen.len());
            if let Some(last) = minutes.last() {
                prop_assert!(window.contains(&candle(*last).key()));
            }
        }
    }
}
