//! 헬스 체크.
//!
//! 감독 대상 의존성(시크릿, 저장소, 데이터 신선도, 메모리, 스트림, 과거 조회)을 각각
//! ok / warning / error로 점수화합니다. 프로브는 동시에 실행되며 각자 타임아웃을
//! 가지므로, 응답하지 않는 의존성이 헬스 체크 루프를 막지 않습니다.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::SeriesKey;
use feed_data::{CandleCache, CandleStore, IngestionProcessor};
use feed_exchange::CircuitState;
use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::collector::{CollectorSlot, StreamState};
use crate::secrets::{SecretsClient, SecretsHealth};

/// 감독 대상 의존성.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Secrets,
    Storage,
    Freshness,
    Memory,
    Stream,
    HistoricalFetch,
}

impl Dependency {
    pub const ALL: [Dependency; 6] = [
        Dependency::Secrets,
        Dependency::Storage,
        Dependency::Freshness,
        Dependency::Memory,
        Dependency::Stream,
        Dependency::HistoricalFetch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::Secrets => "secrets",
            Dependency::Storage => "storage",
            Dependency::Freshness => "freshness",
            Dependency::Memory => "memory",
            Dependency::Stream => "stream",
            Dependency::HistoricalFetch => "historical_fetch",
        }
    }

    /// 수집 경로와 무관한 기반 의존성 여부 (degraded mode 해제 판단용).
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Dependency::Secrets | Dependency::Storage | Dependency::Memory
        )
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 컴포넌트 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Ok,
    Warning,
    Error,
}

/// 개별 컴포넌트 상태.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub dependency: Dependency,
    pub status: ComponentStatus,
    /// 추가 정보 (선택적)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 프로브 소요 시간 (밀리초)
    pub latency_ms: u64,
}

impl ComponentHealth {
    /// 정상 상태.
    pub fn ok(dependency: Dependency) -> Self {
        Self {
            dependency,
            status: ComponentStatus::Ok,
            message: None,
            latency_ms: 0,
        }
    }

    /// 정보 포함 정상 상태.
    pub fn ok_with_info(dependency: Dependency, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok(dependency)
        }
    }

    /// 경고 상태 (느리지만 살아 있음).
    pub fn warning(dependency: Dependency, message: impl Into<String>) -> Self {
        Self {
            dependency,
            status: ComponentStatus::Warning,
            message: Some(message.into()),
            latency_ms: 0,
        }
    }

    /// 비정상 상태.
    pub fn error(dependency: Dependency, message: impl Into<String>) -> Self {
        Self {
            dependency,
            status: ComponentStatus::Error,
            message: Some(message.into()),
            latency_ms: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ComponentStatus::Error
    }
}

/// 전체 헬스 체크 결과.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// error인 컴포넌트가 없으면 true
    pub healthy: bool,
    /// 비정상 사유 요약
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub per_component: BTreeMap<Dependency, ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    fn from_components(components: Vec<ComponentHealth>) -> Self {
        let per_component: BTreeMap<_, _> = components
            .into_iter()
            .map(|c| (c.dependency, c))
            .collect();

        let errors: Vec<String> = per_component
            .values()
            .filter(|c| c.is_error())
            .map(|c| {
                format!(
                    "{}: {}",
                    c.dependency,
                    c.message.as_deref().unwrap_or("error")
                )
            })
            .collect();

        Self {
            healthy: errors.is_empty(),
            reason: (!errors.is_empty()).then(|| errors.join("; ")),
            per_component,
            checked_at: Utc::now(),
        }
    }

    pub fn component(&self, dependency: Dependency) -> Option<&ComponentHealth> {
        self.per_component.get(&dependency)
    }

    /// 해당 의존성이 error인지 여부 (검사하지 않았으면 false).
    pub fn is_failing(&self, dependency: Dependency) -> bool {
        self.component(dependency).is_some_and(ComponentHealth::is_error)
    }
}

/// 헬스 프로브.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn dependency(&self) -> Dependency;

    async fn check(&self) -> ComponentHealth;
}

// ============================================================================
// 프로브 구현
// ============================================================================

/// 시크릿 접근 경로 프로브.
pub struct SecretsProbe {
    client: Arc<SecretsClient>,
}

impl SecretsProbe {
    pub fn new(client: Arc<SecretsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for SecretsProbe {
    fn dependency(&self) -> Dependency {
        Dependency::Secrets
    }

    async fn check(&self) -> ComponentHealth {
        match self.client.health().await {
            SecretsHealth::Primary => ComponentHealth::ok(Dependency::Secrets),
            SecretsHealth::Fallback => {
                ComponentHealth::warning(Dependency::Secrets, "using environment fallback")
            }
            SecretsHealth::Unavailable => {
                ComponentHealth::error(Dependency::Secrets, "no usable secret source")
            }
        }
    }
}

/// 저장소 연결 및 처리기 쓰기 상태 프로브.
pub struct StorageProbe {
    store: Arc<dyn CandleStore>,
    processor: Arc<IngestionProcessor>,
    write_failure_threshold: u64,
}

impl StorageProbe {
    pub fn new(
        store: Arc<dyn CandleStore>,
        processor: Arc<IngestionProcessor>,
        write_failure_threshold: u64,
    ) -> Self {
        Self {
            store,
            processor,
            write_failure_threshold: write_failure_threshold.max(1),
        }
    }
}

#[async_trait]
impl HealthProbe for StorageProbe {
    fn dependency(&self) -> Dependency {
        Dependency::Storage
    }

    async fn check(&self) -> ComponentHealth {
        if let Err(e) = self.store.health_check().await {
            return ComponentHealth::error(Dependency::Storage, format!("{}: {}", self.store.name(), e));
        }
        if !self.processor.is_running().await {
            return ComponentHealth::error(Dependency::Storage, "ingestion processor is not running");
        }

        let stats = self.processor.stats();
        if stats.consecutive_write_failures >= self.write_failure_threshold {
            return ComponentHealth::error(
                Dependency::Storage,
                format!(
                    "{} consecutive write failures: {}",
                    stats.consecutive_write_failures,
                    stats.last_error.unwrap_or_default()
                ),
            );
        }
        if stats.consecutive_write_failures > 0 {
            return ComponentHealth::warning(
                Dependency::Storage,
                format!("{} consecutive write failures", stats.consecutive_write_failures),
            );
        }

        ComponentHealth::ok_with_info(
            Dependency::Storage,
            format!("{} pending, {} written", stats.pending, stats.written),
        )
    }
}

/// 데이터 신선도 프로브.
///
/// 시계열별 최신 실데이터 캔들의 종료 시각이 `timeframe × multiplier`보다
/// 오래되면 stale(warning)입니다. 모든 시계열이 stale이면 error입니다.
/// 합성 캔들은 신선도에 반영하지 않습니다.
pub struct FreshnessProbe {
    store: Arc<dyn CandleStore>,
    cache: Arc<CandleCache>,
    series: Vec<SeriesKey>,
    multiplier: u32,
}

impl FreshnessProbe {
    pub fn new(
        store: Arc<dyn CandleStore>,
        cache: Arc<CandleCache>,
        series: Vec<SeriesKey>,
        multiplier: u32,
    ) -> Self {
        Self {
            store,
            cache,
            series,
            multiplier: multiplier.max(1),
        }
    }

    async fn newest_close(&self, series: &SeriesKey) -> Option<DateTime<Utc>> {
        let cached = self.cache.newest_real(series).map(|c| c.close_time());
        let stored = match self.store.last_candle(series).await {
            Ok(candle) => candle.map(|c| c.close_time()),
            Err(e) => {
                debug!(series = %series, error = %e, "Freshness fallback to cache only");
                None
            }
        };
        cached.max(stored)
    }
}

#[async_trait]
impl HealthProbe for FreshnessProbe {
    fn dependency(&self) -> Dependency {
        Dependency::Freshness
    }

    async fn check(&self) -> ComponentHealth {
        let now = Utc::now();
        let mut stale = Vec::new();
        let mut without_data = 0usize;

        for series in &self.series {
            let limit = series.timeframe.as_chrono() * self.multiplier as i32;
            match self.newest_close(series).await {
                Some(close) if now - close <= limit => {}
                Some(close) => stale.push(format!(
                    "{} ({}s old)",
                    series,
                    (now - close).num_seconds()
                )),
                None => without_data += 1,
            }
        }

        if without_data == self.series.len() {
            return ComponentHealth::warning(Dependency::Freshness, "no candles collected yet");
        }
        if stale.is_empty() {
            return ComponentHealth::ok(Dependency::Freshness);
        }

        let message = format!("stale: {}", stale.join(", "));
        if stale.len() + without_data == self.series.len() {
            ComponentHealth::error(Dependency::Freshness, message)
        } else {
            ComponentHealth::warning(Dependency::Freshness, message)
        }
    }
}

/// RSS 측정 함수 (바이트).
pub type RssReader = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// 메모리 사용량 프로브.
pub struct MemoryProbe {
    limit_bytes: u64,
    warning_ratio: f64,
    reader: RssReader,
}

impl MemoryProbe {
    pub fn new(limit_mb: u64, warning_ratio: f64) -> Self {
        Self {
            limit_bytes: limit_mb.saturating_mul(1024 * 1024),
            warning_ratio,
            reader: Arc::new(read_rss_bytes),
        }
    }

    /// RSS 측정 함수를 교체합니다.
    pub fn with_reader(mut self, reader: RssReader) -> Self {
        self.reader = reader;
        self
    }
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    fn dependency(&self) -> Dependency {
        Dependency::Memory
    }

    async fn check(&self) -> ComponentHealth {
        let Some(rss) = (self.reader)() else {
            return ComponentHealth::ok_with_info(Dependency::Memory, "rss unavailable");
        };

        let rss_mb = rss / (1024 * 1024);
        let limit_mb = self.limit_bytes / (1024 * 1024);
        if rss >= self.limit_bytes {
            ComponentHealth::error(
                Dependency::Memory,
                format!("rss {}MB over limit {}MB", rss_mb, limit_mb),
            )
        } else if rss as f64 >= self.limit_bytes as f64 * self.warning_ratio {
            ComponentHealth::warning(
                Dependency::Memory,
                format!("rss {}MB near limit {}MB", rss_mb, limit_mb),
            )
        } else {
            ComponentHealth::ok_with_info(Dependency::Memory, format!("rss {}MB", rss_mb))
        }
    }
}

/// `/proc/self/statm`에서 RSS를 읽습니다 (Linux 전용).
pub fn read_rss_bytes() -> Option<u64> {
    const PAGE_SIZE: u64 = 4096;
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident * PAGE_SIZE)
}

/// 스트림 상태 프로브.
pub struct StreamProbe {
    slot: Arc<CollectorSlot>,
}

impl StreamProbe {
    pub fn new(slot: Arc<CollectorSlot>) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl HealthProbe for StreamProbe {
    fn dependency(&self) -> Dependency {
        Dependency::Stream
    }

    async fn check(&self) -> ComponentHealth {
        let collector = self.slot.current();
        match collector.stream_state() {
            StreamState::Failed(reason) => ComponentHealth::error(Dependency::Stream, reason),
            StreamState::Stopped => ComponentHealth::error(Dependency::Stream, "stream stopped"),
            StreamState::Idle => ComponentHealth::warning(Dependency::Stream, "stream not started"),
            StreamState::Running => match collector.stream_status() {
                Some(status) if !status.connected => ComponentHealth::warning(
                    Dependency::Stream,
                    format!(
                        "reconnecting ({} consecutive failures)",
                        status.consecutive_failures
                    ),
                ),
                Some(status) => ComponentHealth::ok_with_info(
                    Dependency::Stream,
                    format!("{} candles emitted", status.candles_emitted),
                ),
                None => ComponentHealth::ok(Dependency::Stream),
            },
        }
    }
}

/// 과거 조회 프로브.
///
/// 수집기의 조회 breaker가 Open이거나 HalfOpen(아직 성공한 조회 없음)이면 error,
/// Closed인데 실패가 쌓이고 있으면 warning입니다.
pub struct FetchProbe {
    slot: Arc<CollectorSlot>,
}

impl FetchProbe {
    pub fn new(slot: Arc<CollectorSlot>) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl HealthProbe for FetchProbe {
    fn dependency(&self) -> Dependency {
        Dependency::HistoricalFetch
    }

    async fn check(&self) -> ComponentHealth {
        let collector = self.slot.current();
        if collector.settings().streaming_only {
            return ComponentHealth::ok_with_info(Dependency::HistoricalFetch, "streaming only");
        }

        let metrics = collector.fetch_metrics();
        let tripped_by = metrics
            .tripped_by
            .map_or_else(|| "unclassified".to_string(), |c| c.to_string());
        match metrics.state {
            CircuitState::Open => ComponentHealth::error(
                Dependency::HistoricalFetch,
                format!("fetch circuit open ({tripped_by})"),
            ),
            CircuitState::HalfOpen => ComponentHealth::error(
                Dependency::HistoricalFetch,
                format!("fetch circuit half-open, no successful fetch yet ({tripped_by})"),
            ),
            CircuitState::Closed if metrics.failure_count > 0 => ComponentHealth::warning(
                Dependency::HistoricalFetch,
                format!("{} consecutive fetch failures", metrics.failure_count),
            ),
            CircuitState::Closed => ComponentHealth::ok_with_info(
                Dependency::HistoricalFetch,
                format!("{} fetches succeeded", metrics.total_successes),
            ),
        }
    }
}

// ============================================================================
// 헬스 체커
// ============================================================================

/// 프로브 묶음을 실행하는 헬스 체커.
pub struct HealthChecker {
    probes: Vec<Arc<dyn HealthProbe>>,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            probe_timeout,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.probes.iter().map(|p| p.dependency()).collect()
    }

    /// 모든 프로브를 동시에 실행합니다. 타임아웃된 프로브는 error로 기록됩니다.
    pub async fn check_all(&self) -> HealthStatus {
        let timeout = self.probe_timeout;
        let results = join_all(self.probes.iter().map(|probe| async move {
            let started = Instant::now();
            let mut health = match tokio::time::timeout(timeout, probe.check()).await {
                Ok(health) => health,
                Err(_) => ComponentHealth::error(
                    probe.dependency(),
                    format!("probe timed out after {}ms", timeout.as_millis()),
                ),
            };
            health.latency_ms = started.elapsed().as_millis() as u64;
            health
        }))
        .await;

        HealthStatus::from_components(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use feed_core::{Candle, CandleSource, ProcessorConfig, Symbol, Timeframe};
    use feed_data::MemoryStore;
    use rust_decimal_macros::dec;

    struct SlowProbe;

    #[async_trait]
    impl HealthProbe for SlowProbe {
        fn dependency(&self) -> Dependency {
            Dependency::Storage
        }

        async fn check(&self) -> ComponentHealth {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ComponentHealth::ok(Dependency::Storage)
        }
    }

    fn series(tf: Timeframe) -> SeriesKey {
        SeriesKey::new(Symbol::new("BTC", "USDT"), tf)
    }

    fn candle_at(series: &SeriesKey, open_time: DateTime<Utc>, source: CandleSource) -> Candle {
        Candle::new(
            series.symbol.clone(),
            series.timeframe,
            open_time,
            dec!(10),
            dec!(11),
            dec!(9),
            dec!(10),
            dec!(1),
            source,
        )
    }

    #[tokio::test]
    async fn test_hung_probe_times_out_without_blocking_others() {
        let checker = HealthChecker::new(Duration::from_millis(50))
            .with_probe(Arc::new(SlowProbe))
            .with_probe(Arc::new(MemoryProbe::new(1024, 0.8).with_reader(Arc::new(|| Some(1)))));

        let started = Instant::now();
        let status = checker.check_all().await;
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(!status.healthy);
        assert!(status.is_failing(Dependency::Storage));
        assert_eq!(
            status.component(Dependency::Memory).unwrap().status,
            ComponentStatus::Ok
        );
        assert!(status.reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_memory_probe_levels() {
        let mb = 1024 * 1024;
        let probe = |rss: u64| MemoryProbe::new(100, 0.8).with_reader(Arc::new(move || Some(rss)));

        assert_eq!(probe(10 * mb).check().await.status, ComponentStatus::Ok);
        assert_eq!(probe(85 * mb).check().await.status, ComponentStatus::Warning);
        assert_eq!(probe(120 * mb).check().await.status, ComponentStatus::Error);

        let unknown = MemoryProbe::new(100, 0.8).with_reader(Arc::new(|| None));
        assert_eq!(unknown.check().await.status, ComponentStatus::Ok);
    }

    #[tokio::test]
    async fn test_freshness_ignores_synthetic_and_scores_staleness() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CandleCache::new());
        let m1 = series(Timeframe::M1);
        let h1 = series(Timeframe::H1);
        let probe = FreshnessProbe::new(store.clone(), cache.clone(), vec![m1.clone(), h1.clone()], 3);

        assert_eq!(probe.check().await.status, ComponentStatus::Warning);

        // 합성 캔들은 신선도에 반영되지 않음
        let last_minute = Timeframe::M1.align(Utc::now()) - chrono::Duration::minutes(1);
        cache.update(candle_at(&m1, last_minute, CandleSource::Synthetic));
        assert_eq!(probe.check().await.status, ComponentStatus::Warning);

        cache.update(candle_at(&m1, last_minute, CandleSource::Stream));
        let last_hour = Timeframe::H1.align(Utc::now()) - chrono::Duration::hours(1);
        store.write(&candle_at(&h1, last_hour, CandleSource::Backfill)).await.unwrap();
        assert_eq!(probe.check().await.status, ComponentStatus::Ok);

        // 한 시계열만 오래됨 → warning
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let eth = SeriesKey::new(Symbol::new("ETH", "USDT"), Timeframe::M1);
        store.write(&candle_at(&eth, old, CandleSource::Backfill)).await.unwrap();
        let mixed = FreshnessProbe::new(store.clone(), cache.clone(), vec![eth.clone(), h1], 3);
        assert_eq!(mixed.check().await.status, ComponentStatus::Warning);

        // 모든 시계열이 오래됨 → error
        let dead = FreshnessProbe::new(store, cache, vec![eth], 3);
        assert_eq!(dead.check().await.status, ComponentStatus::Error);
    }

    #[tokio::test]
    async fn test_storage_probe_reports_stopped_processor() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(IngestionProcessor::new(store.clone(), None, ProcessorConfig::default()));
        let probe = StorageProbe::new(store, processor.clone(), 3);

        assert_eq!(probe.check().await.status, ComponentStatus::Ok);
        processor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(probe.check().await.status, ComponentStatus::Error);
    }

    #[test]
    fn test_read_rss_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(read_rss_bytes().unwrap() > 0);
        }
    }
}
