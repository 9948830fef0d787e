//! 수집기 오케스트레이터.
//!
//! 시계열마다 두 가지 경로로 캔들을 모읍니다.
//!
//! - 스트림 태스크: [`DataSource::stream`]으로 확정 캔들을 받아 sink로 전달
//! - 갭 복구 루프: 주기적으로 저장소의 마지막 캔들과 최근 `gap_lookback` 구간을
//!   확인하고 비어 있는 구간을 과거 조회로 채움 (콜드 스타트 백필 포함)
//!
//! 재연결된 스트림이 복구 주기 전에 새 캔들을 쓰면 마지막 캔들은 최신이지만 그
//! 앞에 구멍이 남습니다. 그래서 마지막 캔들 이후뿐 아니라 lookback 구간 안의 중간
//! 구멍도 찾습니다.
//!
//! 과거 조회는 수집기 소유의 circuit breaker를 거칩니다. 연속 실패는 에러 종류별
//! 임계치로 누적되고, 열린 breaker는 헬스 체크에서 error로 보고됩니다.
//!
//! 갭 복구는 이미 저장된 캔들을 덮어쓰지 않습니다. 복구 후에는 처리기 큐가 빌
//! 때까지 기다려, 아직 기록 중인 캔들을 갭으로 다시 판단하지 않도록 합니다.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSink, CandleSource, CollectorConfig, SeriesKey, Timeframe};
use feed_data::{CandleStore, DataError, IngestionProcessor};
use feed_exchange::{
    CategoryThresholds, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, DataSource,
    ExchangeError, StreamStatusSnapshot,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{CollectorError, Result};
use crate::stats::CollectionStats;

// ============================================================================
// 갭 판단
// ============================================================================

/// 한 시계열에 대한 복구 계획.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealPlan {
    /// 스트리밍 전용 모드: 조회하지 않음
    Skip,
    /// 저장된 캔들이 없음: `[since, until]` 전체 백필
    Backfill {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    /// 비어 있는 구간(마지막 캔들 이후 또는 중간 구멍): `[since, until]` 조회
    Gap {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    /// 최신 상태
    UpToDate,
}

/// 저장소의 마지막 캔들 시각으로 복구 계획을 세웁니다.
///
/// `expected_next = last + interval`이고 `now - expected_next > interval`이면
/// 갭으로 보고 `[expected_next, now]`를 조회합니다.
pub fn plan_heal(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeframe: Timeframe,
    backfill_window: chrono::Duration,
    streaming_only: bool,
) -> HealPlan {
    if streaming_only {
        return HealPlan::Skip;
    }

    let interval = timeframe.as_chrono();
    match last {
        None => HealPlan::Backfill {
            since: now - backfill_window,
            until: now,
        },
        Some(last) => {
            let expected_next = last + interval;
            if now - expected_next > interval {
                HealPlan::Gap {
                    since: expected_next,
                    until: now,
                }
            } else {
                HealPlan::UpToDate
            }
        }
    }
}

/// 정렬된 `open_time` 집합에서 중간 구멍을 찾습니다.
///
/// 첫 번째로 빠진 `open_time`과 마지막으로 빠진 `open_time`을 반환합니다.
pub fn find_interior_gap(
    open_times: &BTreeSet<DateTime<Utc>>,
    timeframe: Timeframe,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let interval = timeframe.as_chrono();
    let mut gap: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

    for (prev, next) in open_times.iter().zip(open_times.iter().skip(1)) {
        if *next - *prev > interval {
            let first_missing = *prev + interval;
            let last_missing = *next - interval;
            gap = Some(match gap {
                Some((first, _)) => (first, last_missing),
                None => (first_missing, last_missing),
            });
        }
    }
    gap
}

// ============================================================================
// 설정 / 상태
// ============================================================================

/// 수집기 동작 설정.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub backfill_window: chrono::Duration,
    pub streaming_only: bool,
    pub gap_check_interval: Duration,
    pub quiescence_timeout: Duration,
    pub stop_grace: Duration,
    /// 중간 구멍 탐색 구간
    pub gap_lookback: chrono::Duration,
    /// 과거 조회 breaker 임계치 (rate limit은 두 배)
    pub fetch_failure_threshold: u32,
    pub fetch_reset_timeout: Duration,
}

impl From<&CollectorConfig> for CollectorSettings {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            backfill_window: config.backfill_window(),
            streaming_only: config.streaming_only,
            gap_check_interval: config.gap_check_interval(),
            quiescence_timeout: config.quiescence_timeout(),
            stop_grace: config.stop_grace(),
            gap_lookback: config.gap_lookback(),
            fetch_failure_threshold: config.fetch_failure_threshold,
            fetch_reset_timeout: config.fetch_reset_timeout(),
        }
    }
}

impl CollectorSettings {
    pub fn with_streaming_only(mut self, streaming_only: bool) -> Self {
        self.streaming_only = streaming_only;
        self
    }

    fn fetch_breaker_config(&self) -> CircuitBreakerConfig {
        let threshold = self.fetch_failure_threshold.max(1);
        CircuitBreakerConfig::new(threshold, self.fetch_reset_timeout).with_category_thresholds(
            CategoryThresholds {
                network: threshold,
                rate_limit: threshold.saturating_mul(2),
                timeout: threshold,
                service: threshold,
            },
        )
    }
}

/// 스트림 태스크 상태.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Running,
    Failed(String),
    Stopped,
}

/// 시계열 하나의 복구 결과.
#[derive(Debug, Clone, Serialize)]
pub struct HealReport {
    pub series: SeriesKey,
    pub plan: HealPlan,
    /// 데이터 소스가 반환한 캔들 수
    pub fetched: usize,
    /// 큐에 넣은 캔들 수
    pub enqueued: usize,
}

// ============================================================================
// 수집기
// ============================================================================

struct Inner {
    source: Arc<dyn DataSource>,
    store: Arc<dyn CandleStore>,
    processor: Arc<IngestionProcessor>,
    sink: Arc<dyn CandleSink>,
    series: Vec<SeriesKey>,
    settings: CollectorSettings,
    stream_state: Mutex<StreamState>,
    totals: Mutex<CollectionStats>,
    last_heal_at: Mutex<Option<DateTime<Utc>>>,
    fetch_breaker: CircuitBreaker,
}

/// HalfOpen에서 받은 조회 허가. 조회가 취소돼도 허가를 반납합니다.
struct FetchPermit<'a>(&'a CircuitBreaker);

impl Drop for FetchPermit<'_> {
    fn drop(&mut self) {
        self.0.release_probe();
    }
}

struct RunningTasks {
    stream_token: CancellationToken,
    heal_token: CancellationToken,
    stream: JoinHandle<()>,
    heal: JoinHandle<()>,
}

/// 수집기.
///
/// 데이터 소스는 생성 시 한 번 정해집니다 (실거래소 또는 합성).
/// 스트림 캔들은 `sink`로, 복구 캔들은 항상 처리기로 들어갑니다.
pub struct Collector {
    inner: Arc<Inner>,
    tasks: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl Collector {
    pub fn new(
        source: Arc<dyn DataSource>,
        store: Arc<dyn CandleStore>,
        processor: Arc<IngestionProcessor>,
        sink: Arc<dyn CandleSink>,
        series: Vec<SeriesKey>,
        settings: CollectorSettings,
    ) -> Self {
        let fetch_breaker = CircuitBreaker::new(
            format!("{}-fetch", source.name()),
            settings.fetch_breaker_config(),
        );
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                processor,
                sink,
                series,
                settings,
                stream_state: Mutex::new(StreamState::Idle),
                totals: Mutex::new(CollectionStats::new()),
                last_heal_at: Mutex::new(None),
                fetch_breaker,
            }),
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    /// 스트림 태스크와 갭 복구 루프를 시작합니다.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(CollectorError::InvalidState(
                "collector is already running".to_string(),
            ));
        }
        if self.inner.series.is_empty() {
            return Err(CollectorError::Config("no series configured".to_string()));
        }

        let stream_token = CancellationToken::new();
        let heal_token = CancellationToken::new();
        self.inner.set_stream_state(StreamState::Running);

        let stream = tokio::spawn(run_stream(self.inner.clone(), stream_token.clone()));
        let heal = tokio::spawn(run_heal_loop(self.inner.clone(), heal_token.clone()));

        info!(
            source = self.inner.source.name(),
            series = self.inner.series.len(),
            streaming_only = self.inner.settings.streaming_only,
            gap_check_secs = self.inner.settings.gap_check_interval.as_secs(),
            "Collector started"
        );

        *tasks = Some(RunningTasks {
            stream_token,
            heal_token,
            stream,
            heal,
        });
        Ok(())
    }

    /// 스트림을 먼저 멈추고 갭 복구 루프를 멈춥니다.
    ///
    /// 각 태스크는 `grace` 안에 끝나지 않으면 중단됩니다. 모두 정상 종료하면 `true`.
    pub async fn stop(&self, grace: Duration) -> bool {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return true;
        };

        tasks.stream_token.cancel();
        let stream_clean = join_with_grace(tasks.stream, grace, "stream").await;

        tasks.heal_token.cancel();
        let heal_clean = join_with_grace(tasks.heal, grace, "gap-heal").await;

        self.inner.set_stream_state(StreamState::Stopped);
        info!(
            source = self.inner.source.name(),
            clean = stream_clean && heal_clean,
            "Collector stopped"
        );
        stream_clean && heal_clean
    }

    /// 중지 → 대기 → 시작.
    pub async fn restart(&self, pause: Duration) -> Result<()> {
        info!(pause_secs = pause.as_secs(), "Restarting collector");
        self.stop(self.inner.settings.stop_grace).await;
        tokio::time::sleep(pause).await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// 시계열 하나를 점검하고 필요하면 복구합니다.
    pub async fn heal_series(&self, series: &SeriesKey, now: DateTime<Utc>) -> Result<HealReport> {
        self.inner.heal_series(series, now).await
    }

    /// 모든 시계열에 대해 복구 패스를 한 번 실행합니다.
    pub async fn heal_all(&self) -> CollectionStats {
        self.inner.heal_all(Utc::now()).await
    }

    pub async fn heal_all_at(&self, now: DateTime<Utc>) -> CollectionStats {
        self.inner.heal_all(now).await
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner
            .stream_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stream_status(&self) -> Option<StreamStatusSnapshot> {
        self.inner.source.stream_status()
    }

    /// 과거 조회 breaker 상태.
    pub fn fetch_metrics(&self) -> CircuitBreakerMetrics {
        self.inner.fetch_breaker.metrics()
    }

    /// 지금까지 누적된 복구 통계.
    pub fn stats(&self) -> CollectionStats {
        self.inner
            .totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_heal_at(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_heal_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn series(&self) -> &[SeriesKey] {
        &self.inner.series
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.inner.source
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.inner.settings
    }
}

impl Inner {
    fn set_stream_state(&self, state: StreamState) {
        *self
            .stream_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn heal_series(&self, series: &SeriesKey, now: DateTime<Utc>) -> Result<HealReport> {
        let span = feed_core::series_span!("heal_series", series, self.source.name());
        async move {
            let last = self.store.last_candle(series).await?.map(|c| c.open_time);
            let mut plan = plan_heal(
                last,
                now,
                series.timeframe,
                self.settings.backfill_window,
                self.settings.streaming_only,
            );

            // lookback 구간 안의 저장된 캔들 (중간 구멍 탐색, 중복 조회 방지)
            let mut known = BTreeSet::new();
            if let (Some(last), false) = (last, self.settings.streaming_only) {
                let interval = series.timeframe.as_chrono();
                let window_start = series.timeframe.align(now - self.settings.gap_lookback);
                known = self
                    .store
                    .range(series, window_start, last + interval)
                    .await?
                    .into_iter()
                    .map(|c| c.open_time)
                    .collect();

                if let Some((first_missing, last_missing)) =
                    find_interior_gap(&known, series.timeframe)
                {
                    debug!(first_missing = %first_missing, last_missing = %last_missing, "Interior gap found");
                    plan = match plan {
                        HealPlan::Gap { until, .. } => HealPlan::Gap {
                            since: first_missing,
                            until,
                        },
                        _ => HealPlan::Gap {
                            since: first_missing,
                            until: last_missing + interval,
                        },
                    };
                }
            }

            let mut report = HealReport {
                series: series.clone(),
                plan,
                fetched: 0,
                enqueued: 0,
            };

            let (since, until, tag) = match plan {
                HealPlan::Skip => {
                    debug!(last = ?last, "Streaming-only mode, heal skipped");
                    return Ok(report);
                }
                HealPlan::UpToDate => {
                    debug!(last = ?last, "Series up to date");
                    return Ok(report);
                }
                HealPlan::Backfill { since, until } => {
                    info!(since = %since, until = %until, "Cold start backfill");
                    (since, until, CandleSource::Backfill)
                }
                HealPlan::Gap { since, until } => {
                    info!(since = %since, until = %until, "Gap detected");
                    (since, until, CandleSource::GapFill)
                }
            };

            let candles = self.fetch_guarded(series, since, until).await?;
            report.fetched = candles.len();

            for candle in candles {
                if candle.open_time < since
                    || known.contains(&candle.open_time)
                    || !candle.is_closed_at(now)
                {
                    continue;
                }
                let candle = if candle.source.is_synthetic() {
                    candle
                } else {
                    candle.with_source(tag)
                };
                match self.processor.enqueue(candle).await {
                    Ok(()) => report.enqueued += 1,
                    // 이미 처리기에서 기록됨
                    Err(DataError::InvalidData(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if report.enqueued > 0
                && !self
                    .processor
                    .wait_empty(self.settings.quiescence_timeout)
                    .await
            {
                warn!(
                    pending = self.processor.pending(),
                    timeout_secs = self.settings.quiescence_timeout.as_secs(),
                    "Processor did not reach quiescence after heal"
                );
            }

            info!(
                fetched = report.fetched,
                enqueued = report.enqueued,
                "Series healed"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// breaker가 허용할 때만 조회하고 결과를 breaker에 기록합니다.
    async fn fetch_guarded(
        &self,
        series: &SeriesKey,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        if !self.fetch_breaker.is_allowed() {
            return Err(ExchangeError::CircuitOpen(self.fetch_breaker.name().to_string()).into());
        }
        let _permit = FetchPermit(&self.fetch_breaker);

        let result = self
            .source
            .fetch_range(&series.symbol, series.timeframe, since, until, None)
            .await;
        self.fetch_breaker.record_result(&result);
        Ok(result?)
    }

    async fn heal_all(&self, now: DateTime<Utc>) -> CollectionStats {
        let started = Instant::now();
        let mut stats = CollectionStats::new();

        for series in &self.series {
            stats.total += 1;
            match self.heal_series(series, now).await {
                Ok(report) => {
                    match report.plan {
                        HealPlan::Skip => stats.skipped += 1,
                        HealPlan::UpToDate => stats.up_to_date += 1,
                        HealPlan::Backfill { .. } => stats.backfilled += 1,
                        HealPlan::Gap { .. } => stats.gap_healed += 1,
                    }
                    stats.fetched += report.fetched;
                    stats.enqueued += report.enqueued;
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(series = %series, error = %e, "Heal failed");
                }
            }
        }

        stats.elapsed = started.elapsed();
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(&stats);
        *self
            .last_heal_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        stats
    }
}

async fn run_stream(inner: Arc<Inner>, token: CancellationToken) {
    let result = inner
        .source
        .stream(inner.series.clone(), inner.sink.clone(), token.clone())
        .await;

    let state = match result {
        _ if token.is_cancelled() => StreamState::Stopped,
        Ok(()) => {
            warn!(source = inner.source.name(), "Stream ended without shutdown");
            StreamState::Failed("stream ended unexpectedly".to_string())
        }
        Err(e) => {
            error!(source = inner.source.name(), error = %e, "Stream failed");
            StreamState::Failed(e.to_string())
        }
    };
    inner.set_stream_state(state);
}

async fn run_heal_loop(inner: Arc<Inner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.settings.gap_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    stats = inner.heal_all(Utc::now()) => stats.log_summary("gap-heal"),
                }
            }
        }
    }
    debug!("Gap-heal loop stopped");
}

async fn join_with_grace(mut handle: JoinHandle<()>, grace: Duration, task: &str) -> bool {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(task, error = %e, "Task panicked");
            false
        }
        Err(_) => {
            warn!(task, grace_secs = grace.as_secs(), "Task did not stop in time, aborting");
            handle.abort();
            false
        }
    }
}

/// 현재 활성 수집기를 가리키는 슬롯.
///
/// degraded mode 전환 시 감독자가 수집기를 교체하고, 프로브는 항상 현재 것을 봅니다.
pub struct CollectorSlot {
    current: RwLock<Arc<Collector>>,
}

impl CollectorSlot {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            current: RwLock::new(collector),
        }
    }

    pub fn current(&self) -> Arc<Collector> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 수집기를 교체하고 이전 것을 반환합니다.
    pub fn replace(&self, next: Arc<Collector>) -> Arc<Collector> {
        std::mem::replace(
            &mut *self.current.write().unwrap_or_else(PoisonError::into_inner),
            next,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use feed_core::{ProcessorConfig, Symbol};
    use feed_data::MemoryStore;
    use feed_exchange::{CircuitState, ErrorCategory, ExchangeResult, HistoricalDataProvider};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn btc_5m() -> SeriesKey {
        SeriesKey::new(Symbol::new("BTC", "USDT"), Timeframe::M5)
    }

    fn candle(series: &SeriesKey, open_time: DateTime<Utc>, source: CandleSource) -> Candle {
        Candle::new(
            series.symbol.clone(),
            series.timeframe,
            open_time,
            dec!(100),
            dec!(102),
            dec!(99),
            dec!(101),
            dec!(5),
            source,
        )
    }

    /// 범위 안의 확정 캔들을 만들어 주고 호출을 기록하는 소스.
    #[derive(Default)]
    struct RecordingSource {
        calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        fail_stream: bool,
        fail_fetch: bool,
    }

    #[async_trait]
    impl HistoricalDataProvider for RecordingSource {
        async fn fetch_range(
            &self,
            symbol: &Symbol,
            timeframe: Timeframe,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
            _limit: Option<usize>,
        ) -> ExchangeResult<Vec<Candle>> {
            self.calls.lock().unwrap().push((since, until));
            if self.fail_fetch {
                return Err(ExchangeError::FetchUnavailable {
                    attempts: 5,
                    last_error: "503 Service Unavailable".into(),
                });
            }
            let series = SeriesKey::new(symbol.clone(), timeframe);
            let mut open_time = timeframe.align(since);
            if open_time < since {
                open_time = timeframe.next_open(open_time);
            }
            let mut out = Vec::new();
            while timeframe.next_open(open_time) <= until {
                out.push(candle(&series, open_time, CandleSource::Backfill));
                open_time = timeframe.next_open(open_time);
            }
            Ok(out)
        }
    }

    #[async_trait]
    impl DataSource for RecordingSource {
        fn name(&self) -> &str {
            "recording"
        }

        async fn stream(
            &self,
            _series: Vec<SeriesKey>,
            _sink: Arc<dyn CandleSink>,
            shutdown: CancellationToken,
        ) -> ExchangeResult<()> {
            if self.fail_stream {
                return Err(ExchangeError::ReconnectExhausted { attempts: 3 });
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            backfill_window: chrono::Duration::days(1),
            streaming_only: false,
            gap_check_interval: Duration::from_secs(3600),
            quiescence_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
            gap_lookback: chrono::Duration::hours(24),
            fetch_failure_threshold: 3,
            fetch_reset_timeout: Duration::from_secs(300),
        }
    }

    fn collector(source: Arc<RecordingSource>, store: Arc<MemoryStore>, settings: CollectorSettings) -> Collector {
        let processor = Arc::new(IngestionProcessor::new(store.clone(), None, ProcessorConfig::default()));
        Collector::new(
            source,
            store,
            processor.clone(),
            processor,
            vec![btc_5m()],
            settings,
        )
    }

    #[test]
    fn test_plan_heal_cold_start() {
        let now = t0();
        assert_eq!(
            plan_heal(None, now, Timeframe::M5, chrono::Duration::days(30), false),
            HealPlan::Backfill {
                since: now - chrono::Duration::days(30),
                until: now,
            }
        );
    }

    #[test]
    fn test_plan_heal_gap_after_35_minutes() {
        let last = t0();
        let now = last + chrono::Duration::minutes(35);
        assert_eq!(
            plan_heal(Some(last), now, Timeframe::M5, chrono::Duration::days(30), false),
            HealPlan::Gap {
                since: last + chrono::Duration::minutes(5),
                until: now,
            }
        );
    }

    #[test]
    fn test_plan_heal_boundaries() {
        let last = t0();
        let window = chrono::Duration::days(30);
        // now - expected_next == interval: 아직 갭 아님
        let now = last + chrono::Duration::minutes(10);
        assert_eq!(plan_heal(Some(last), now, Timeframe::M5, window, false), HealPlan::UpToDate);

        let now = now + chrono::Duration::seconds(1);
        assert!(matches!(
            plan_heal(Some(last), now, Timeframe::M5, window, false),
            HealPlan::Gap { .. }
        ));

        // 스트리밍 전용 모드는 어떤 경우에도 조회하지 않음
        assert_eq!(plan_heal(None, now, Timeframe::M5, window, true), HealPlan::Skip);
        assert_eq!(plan_heal(Some(last), now, Timeframe::M5, window, true), HealPlan::Skip);
    }

    #[test]
    fn test_find_interior_gap() {
        let at = |m: i64| t0() + chrono::Duration::minutes(m);
        let contiguous: BTreeSet<_> = [0, 5, 10].into_iter().map(at).collect();
        assert_eq!(find_interior_gap(&contiguous, Timeframe::M5), None);
        assert_eq!(find_interior_gap(&BTreeSet::new(), Timeframe::M5), None);

        // 구멍이 여러 개면 첫 구멍의 시작부터 마지막 구멍의 끝까지
        let holes: BTreeSet<_> = [0, 15, 20, 35].into_iter().map(at).collect();
        assert_eq!(
            find_interior_gap(&holes, Timeframe::M5),
            Some((at(5), at(30)))
        );
    }

    #[tokio::test]
    async fn test_interior_gap_is_healed_after_stream_resumes() {
        let series = btc_5m();
        let store = Arc::new(MemoryStore::new());
        // t0, 이후 10~25분은 재연결된 스트림이 기록 (5분 캔들 하나 빠짐)
        for m in [0, 10, 15, 20, 25] {
            let open_time = t0() + chrono::Duration::minutes(m);
            store.write(&candle(&series, open_time, CandleSource::Stream)).await.unwrap();
        }

        let source = Arc::new(RecordingSource::default());
        let collector = collector(source.clone(), store.clone(), settings());

        let now = t0() + chrono::Duration::minutes(31);
        let report = collector.heal_series(&series, now).await.unwrap();
        let missing = t0() + chrono::Duration::minutes(5);
        assert_eq!(
            report.plan,
            HealPlan::Gap {
                since: missing,
                until: missing + chrono::Duration::minutes(5),
            }
        );
        assert_eq!(report.enqueued, 1);

        let stored = store.snapshot(&series).await;
        assert_eq!(stored.len(), 6);
        assert_eq!(stored[1].open_time, missing);
        assert_eq!(stored[1].source, CandleSource::GapFill);

        // 메운 뒤에는 더 조회하지 않음
        let stats = collector.heal_all_at(now).await;
        assert_eq!(stats.up_to_date, 1);
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failures_open_breaker_and_stop_fetching() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(RecordingSource {
            fail_fetch: true,
            ..Default::default()
        });
        let mut settings = settings();
        settings.fetch_failure_threshold = 2;
        let collector = collector(source.clone(), store, settings);

        let first = collector.heal_all_at(t0()).await;
        assert_eq!(first.errors, 1);
        let metrics = collector.fetch_metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 1);

        collector.heal_all_at(t0()).await;
        let metrics = collector.fetch_metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.tripped_by, Some(ErrorCategory::Service));

        // Open 동안에는 조회하지 않음
        let blocked = collector.heal_all_at(t0()).await;
        assert_eq!(blocked.errors, 1);
        assert_eq!(source.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_heal_series_fills_gap_without_boundary_duplicate() {
        let series = btc_5m();
        let store = Arc::new(MemoryStore::new());
        store.write(&candle(&series, t0(), CandleSource::Stream)).await.unwrap();

        let source = Arc::new(RecordingSource::default());
        let collector = collector(source.clone(), store.clone(), settings());

        let now = t0() + chrono::Duration::minutes(35);
        let report = collector.heal_series(&series, now).await.unwrap();

        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![(t0() + chrono::Duration::minutes(5), now)]
        );
        assert_eq!(report.enqueued, 6);

        let stored = store.snapshot(&series).await;
        assert_eq!(stored.len(), 7);
        assert_eq!(stored[0].source, CandleSource::Stream);
        assert!(stored[1..].iter().all(|c| c.source == CandleSource::GapFill));
        assert_eq!(stored.last().unwrap().open_time, t0() + chrono::Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_streaming_only_never_fetches() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(RecordingSource::default());
        let collector = collector(source.clone(), store.clone(), settings().with_streaming_only(true));

        let stats = collector.heal_all_at(t0()).await;
        assert_eq!(stats.skipped, 1);
        assert!(source.calls.lock().unwrap().is_empty());
        assert_eq!(store.total().await, 0);
    }

    #[tokio::test]
    async fn test_stream_failure_is_reported_and_stop_is_clean() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(RecordingSource {
            fail_stream: true,
            ..Default::default()
        });
        let collector = collector(source, store, settings().with_streaming_only(true));

        collector.start().await.unwrap();
        assert!(collector.start().await.is_err());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !matches!(collector.stream_state(), StreamState::Failed(_)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(collector.stop(Duration::from_secs(1)).await);
        assert_eq!(collector.stream_state(), StreamState::Stopped);
        assert!(!collector.is_running().await);
    }

    #[tokio::test]
    async fn test_slot_replace_returns_previous() {
        let store = Arc::new(MemoryStore::new());
        let first = Arc::new(collector(Arc::new(RecordingSource::default()), store.clone(), settings()));
        let second = Arc::new(collector(Arc::new(RecordingSource::default()), store, settings()));

        let slot = CollectorSlot::new(first.clone());
        let previous = slot.replace(second.clone());
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&slot.current(), &second));
    }
}
