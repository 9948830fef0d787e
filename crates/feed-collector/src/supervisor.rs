//! 복원력 감독자.
//!
//! 주기적으로 헬스 체크를 실행하고, 의존성마다 하나씩 둔 circuit breaker로
//! 복구 동작을 결정합니다.
//!
//! ```text
//! error 누적 ≥ 임계치 → Open + 표적 복구
//!   (reset_timeout 경과) → HalfOpen: 이번 헬스 체크 결과가 단일 프로브
//!     성공 → Closed
//!     실패 → Open, 표적 복구 재시도 → 한도 초과 시 전체 재시작(에스컬레이션)
//!       에스컬레이션 한도 초과 → 전체 장애
//!         합성 대체 허용: degraded mode (합성 캔들은 캐시에만)
//!         그 외: SupervisorExit::Fatal (프로세스 종료, 외부 감독자가 재시작)
//! ```
//!
//! degraded mode에서는 기반 의존성(시크릿, 저장소, 메모리)이 정상이고 실데이터
//! 소스에 다시 접근할 수 있으면 합성 캐시를 비우고 실수집기로 돌아갑니다.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use feed_core::SupervisorConfig;
use feed_data::{CandleCache, CandleStore, IngestionProcessor};
use feed_exchange::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::{Collector, CollectorSlot};
use crate::health::{
    Dependency, FetchProbe, FreshnessProbe, HealthChecker, HealthStatus, MemoryProbe,
    SecretsProbe, StorageProbe, StreamProbe,
};
use crate::liveness::LivenessMarker;
use crate::secrets::SecretsClient;

/// 복구 동작.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 시크릿 클라이언트 재초기화
    ReacquireSecrets,
    /// 저장소 연결 재검증
    RevalidateStorage,
    /// 수집기 재시작 (중지 → 대기 → 시작)
    RestartCollector,
    /// 캐시 축소, 중복 제거 window 비우기
    RelieveMemoryPressure,
    /// 에스컬레이션: 긴 대기 후 시크릿 재초기화 + 수집기 전체 재시작
    FullRestart,
    /// 합성 데이터 대체 시작
    EnterDegradedMode,
    /// 실데이터 수집 복귀
    ExitDegradedMode,
}

impl RecoveryAction {
    /// 의존성별 표적 복구 동작.
    pub fn for_dependency(dependency: Dependency) -> Self {
        match dependency {
            Dependency::Secrets => RecoveryAction::ReacquireSecrets,
            Dependency::Storage => RecoveryAction::RevalidateStorage,
            Dependency::Freshness | Dependency::Stream | Dependency::HistoricalFetch => {
                RecoveryAction::RestartCollector
            }
            Dependency::Memory => RecoveryAction::RelieveMemoryPressure,
        }
    }
}

/// 감독자 동작 모드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorMode {
    Normal,
    Degraded,
}

impl SupervisorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorMode::Normal => "normal",
            SupervisorMode::Degraded => "degraded",
        }
    }
}

/// 감독 루프 종료 사유.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// 종료 신호에 의한 정상 종료
    Shutdown,
    /// 복구 불가능한 전체 장애
    Fatal(String),
}

/// 헬스 체크 한 번의 결과.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub health: HealthStatus,
    pub actions: Vec<RecoveryAction>,
    pub mode: SupervisorMode,
    pub exit: Option<SupervisorExit>,
}

/// 감독 대상 컴포넌트.
#[derive(Clone)]
pub struct SupervisedComponents {
    pub secrets: Arc<SecretsClient>,
    pub store: Arc<dyn CandleStore>,
    pub processor: Arc<IngestionProcessor>,
    pub cache: Arc<CandleCache>,
    /// 실데이터 수집기
    pub collector: Arc<Collector>,
    /// 현재 활성 수집기 (degraded mode에서는 합성 수집기)
    pub slot: Arc<CollectorSlot>,
}

enum BreakerEvent {
    Tripped,
    ProbeSucceeded,
    ProbeFailed,
}

#[derive(Default)]
struct EscalationState {
    failed_recoveries: HashMap<Dependency, u32>,
    escalations: u32,
}

/// 복원력 감독자.
pub struct ResilienceSupervisor {
    config: SupervisorConfig,
    components: SupervisedComponents,
    checker: HealthChecker,
    breakers: BTreeMap<Dependency, CircuitBreaker>,
    fallback: Option<Arc<Collector>>,
    liveness: LivenessMarker,
    restart_pause: Duration,
    processor_grace: Duration,
    mode: Mutex<SupervisorMode>,
    escalation: Mutex<EscalationState>,
}

impl ResilienceSupervisor {
    pub fn new(config: SupervisorConfig, components: SupervisedComponents, checker: HealthChecker) -> Self {
        let breaker_config = CircuitBreakerConfig::new(config.failure_threshold, config.reset_timeout());
        let breakers = Dependency::ALL
            .iter()
            .map(|dep| (*dep, CircuitBreaker::new(dep.as_str(), breaker_config.clone())))
            .collect();
        let liveness = LivenessMarker::new(config.liveness_path.as_ref().map(PathBuf::from));

        Self {
            config,
            components,
            checker,
            breakers,
            fallback: None,
            liveness,
            restart_pause: Duration::from_secs(5),
            processor_grace: Duration::from_secs(10),
            mode: Mutex::new(SupervisorMode::Normal),
            escalation: Mutex::new(EscalationState::default()),
        }
    }

    /// 모든 의존성 프로브를 갖춘 헬스 체커를 만듭니다.
    pub fn standard_checker(config: &SupervisorConfig, components: &SupervisedComponents) -> HealthChecker {
        HealthChecker::new(config.probe_timeout())
            .with_probe(Arc::new(SecretsProbe::new(components.secrets.clone())))
            .with_probe(Arc::new(StorageProbe::new(
                components.store.clone(),
                components.processor.clone(),
                u64::from(config.failure_threshold),
            )))
            .with_probe(Arc::new(FreshnessProbe::new(
                components.store.clone(),
                components.cache.clone(),
                components.collector.series().to_vec(),
                config.freshness_multiplier,
            )))
            .with_probe(Arc::new(MemoryProbe::new(
                config.memory_limit_mb,
                config.memory_warning_ratio,
            )))
            .with_probe(Arc::new(StreamProbe::new(components.slot.clone())))
            .with_probe(Arc::new(FetchProbe::new(components.slot.clone())))
    }

    /// 전체 장애 시 사용할 합성 수집기를 지정합니다.
    ///
    /// 합성 수집기의 sink는 캐시 전용이어야 합니다. 운영 프로파일에서는 호출하지 않습니다.
    pub fn with_synthetic_fallback(mut self, collector: Arc<Collector>) -> Self {
        self.fallback = Some(collector);
        self
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    pub fn with_processor_grace(mut self, grace: Duration) -> Self {
        self.processor_grace = grace;
        self
    }

    pub fn mode(&self) -> SupervisorMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: SupervisorMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn breaker_state(&self, dependency: Dependency) -> Option<CircuitState> {
        self.breakers.get(&dependency).map(CircuitBreaker::state)
    }

    pub fn breaker_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        self.breakers.values().map(CircuitBreaker::metrics).collect()
    }

    pub fn liveness(&self) -> &LivenessMarker {
        &self.liveness
    }

    pub fn components(&self) -> &SupervisedComponents {
        &self.components
    }

    /// 헬스 체크 → breaker 갱신 → 복구/에스컬레이션을 한 번 수행합니다.
    pub async fn tick(&self) -> TickReport {
        let health = self.checker.check_all().await;
        let mut actions = Vec::new();
        let mut exit = None;

        match self.mode() {
            SupervisorMode::Normal => {
                exit = self.supervise(&health, &mut actions).await;
            }
            SupervisorMode::Degraded => {
                if health.is_failing(Dependency::Memory) {
                    self.perform(RecoveryAction::RelieveMemoryPressure).await;
                    actions.push(RecoveryAction::RelieveMemoryPressure);
                }
                if self.infrastructure_recovered(&health).await {
                    self.exit_degraded().await;
                    actions.push(RecoveryAction::ExitDegradedMode);
                }
            }
        }

        let mode = self.mode();
        self.liveness
            .beat(health.healthy, mode.as_str(), health.reason.as_deref())
            .await;
        if !health.healthy {
            warn!(
                mode = mode.as_str(),
                reason = health.reason.as_deref().unwrap_or_default(),
                actions = ?actions,
                "Health check failed"
            );
        }

        TickReport {
            health,
            actions,
            mode,
            exit,
        }
    }

    async fn supervise(
        &self,
        health: &HealthStatus,
        actions: &mut Vec<RecoveryAction>,
    ) -> Option<SupervisorExit> {
        let mut targeted = BTreeSet::new();
        let mut escalate = false;
        let mut exhausted = Vec::new();

        for dependency in self.checker.dependencies() {
            let failing = health.is_failing(dependency);
            let Some(event) = self.observe(dependency, failing) else {
                continue;
            };

            let mut state = self.escalation.lock().unwrap_or_else(PoisonError::into_inner);
            match event {
                BreakerEvent::Tripped => {
                    targeted.insert(RecoveryAction::for_dependency(dependency));
                }
                BreakerEvent::ProbeSucceeded => {
                    state.failed_recoveries.remove(&dependency);
                    info!(dependency = %dependency, "Dependency recovered");
                }
                BreakerEvent::ProbeFailed => {
                    let failed = state.failed_recoveries.entry(dependency).or_insert(0);
                    *failed += 1;
                    if *failed < self.config.max_targeted_recoveries {
                        targeted.insert(RecoveryAction::for_dependency(dependency));
                    } else {
                        *failed = 0;
                        escalate = true;
                        exhausted.push(dependency);
                    }
                }
            }
        }

        if self.breakers.values().all(|b| b.state() == CircuitState::Closed) {
            self.escalation
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .escalations = 0;
        }

        if escalate {
            let escalations = {
                let mut state = self.escalation.lock().unwrap_or_else(PoisonError::into_inner);
                state.escalations += 1;
                state.escalations
            };

            if escalations > self.config.max_escalations {
                let reason = format!(
                    "recovery exhausted for {} after {} escalations: {}",
                    exhausted
                        .iter()
                        .map(Dependency::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                    escalations - 1,
                    health.reason.as_deref().unwrap_or("unknown")
                );
                return self.total_failure(reason, actions).await;
            }

            warn!(escalations, exhausted = ?exhausted, "Targeted recovery failed, escalating");
            self.perform(RecoveryAction::FullRestart).await;
            actions.push(RecoveryAction::FullRestart);
            return None;
        }

        for action in targeted {
            self.perform(action).await;
            actions.push(action);
        }
        None
    }

    /// breaker에 이번 결과를 반영하고 의미 있는 전이를 반환합니다.
    fn observe(&self, dependency: Dependency, failing: bool) -> Option<BreakerEvent> {
        let breaker = self.breakers.get(&dependency)?;
        match breaker.state() {
            CircuitState::Closed => {
                if failing {
                    let opened_before = breaker.metrics().open_count;
                    breaker.record_failure();
                    (breaker.metrics().open_count > opened_before).then_some(BreakerEvent::Tripped)
                } else {
                    breaker.record_success();
                    None
                }
            }
            // reset_timeout 동안은 복구를 재시도하지 않음
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if !breaker.is_allowed() {
                    return None;
                }
                if failing {
                    breaker.record_failure();
                    Some(BreakerEvent::ProbeFailed)
                } else {
                    breaker.record_success();
                    Some(BreakerEvent::ProbeSucceeded)
                }
            }
        }
    }

    async fn perform(&self, action: RecoveryAction) {
        info!(action = ?action, "Running recovery action");
        match action {
            RecoveryAction::ReacquireSecrets => {
                let health = self.components.secrets.reinit().await;
                info!(health = ?health, "Secrets client reacquired");
            }
            RecoveryAction::RevalidateStorage => {
                match self.components.store.health_check().await {
                    Ok(()) => info!(store = self.components.store.name(), "Storage revalidated"),
                    Err(e) => error!(store = self.components.store.name(), error = %e, "Storage still unavailable"),
                }
                if !self.components.processor.is_running().await {
                    error!("Ingestion processor is not running");
                }
            }
            RecoveryAction::RestartCollector => {
                let collector = self.components.slot.current();
                if let Err(e) = collector.restart(self.restart_pause).await {
                    error!(error = %e, "Collector restart failed");
                }
            }
            RecoveryAction::RelieveMemoryPressure => {
                let evicted = self.components.cache.shrink();
                let cleared = self.components.processor.clear_dedup_window();
                info!(evicted, cleared, "Memory pressure relieved");
            }
            RecoveryAction::FullRestart => {
                let collector = self.components.slot.current();
                collector.stop(collector.settings().stop_grace).await;
                tokio::time::sleep(self.config.escalation_pause()).await;
                self.components.secrets.reinit().await;
                self.components.cache.shrink();
                if let Err(e) = collector.start().await {
                    error!(error = %e, "Full restart failed to start collector");
                }
            }
            RecoveryAction::EnterDegradedMode | RecoveryAction::ExitDegradedMode => {}
        }
    }

    async fn total_failure(
        &self,
        reason: String,
        actions: &mut Vec<RecoveryAction>,
    ) -> Option<SupervisorExit> {
        let Some(fallback) = self.fallback.clone() else {
            error!(reason = %reason, "Total failure, no synthetic fallback configured");
            return Some(SupervisorExit::Fatal(reason));
        };

        warn!(reason = %reason, "Total failure, entering degraded mode with synthetic data");
        let real = self.components.slot.current();
        real.stop(real.settings().stop_grace).await;

        self.components.slot.replace(fallback.clone());
        if let Err(e) = fallback.start().await {
            error!(error = %e, "Synthetic collector failed to start");
        }

        self.reset_supervision();
        self.set_mode(SupervisorMode::Degraded);
        actions.push(RecoveryAction::EnterDegradedMode);
        None
    }

    async fn infrastructure_recovered(&self, health: &HealthStatus) -> bool {
        let infrastructure_ok = self
            .checker
            .dependencies()
            .into_iter()
            .filter(Dependency::is_infrastructure)
            .all(|dep| !health.is_failing(dep));
        infrastructure_ok && self.real_source_reachable().await
    }

    /// 실데이터 소스에서 최근 캔들 하나를 조회해 봅니다.
    async fn real_source_reachable(&self) -> bool {
        let collector = &self.components.collector;
        let Some(series) = collector.series().first() else {
            return false;
        };
        let now = Utc::now();
        let since = now - series.timeframe.as_chrono() * 3;
        let probe = collector
            .source()
            .fetch_range(&series.symbol, series.timeframe, since, now, Some(1));

        match tokio::time::timeout(self.config.probe_timeout(), probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                info!(source = collector.source().name(), error = %e, "Real source still unavailable");
                false
            }
            Err(_) => false,
        }
    }

    async fn exit_degraded(&self) {
        info!("Infrastructure recovered, leaving degraded mode");
        let synthetic = self.components.slot.current();
        synthetic.stop(synthetic.settings().stop_grace).await;

        let evicted = self.components.cache.evict_synthetic();
        let real = self.components.collector.clone();
        self.components.slot.replace(real.clone());
        if let Err(e) = real.start().await {
            error!(error = %e, "Real collector failed to restart");
        }

        self.reset_supervision();
        self.set_mode(SupervisorMode::Normal);
        info!(evicted, "Real collection resumed");
    }

    fn reset_supervision(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
        *self.escalation.lock().unwrap_or_else(PoisonError::into_inner) = EscalationState::default();
    }

    /// 감독 루프를 실행합니다.
    ///
    /// 수집기를 시작하고 `health_check_interval`마다 [`tick`](Self::tick)을 수행합니다.
    /// `shutdown`이 취소되거나 전체 장애가 나면 순서대로 종료한 뒤 사유를 반환합니다.
    pub async fn run(&self, shutdown: CancellationToken) -> SupervisorExit {
        if let Err(e) = self.components.slot.current().start().await {
            warn!(error = %e, "Collector start skipped");
        }

        let mut ticker = tokio::time::interval(self.config.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // 첫 tick 건너뛰기 (수집기 기동 대기)

        info!(
            interval_secs = self.config.health_check_interval_secs,
            failure_threshold = self.config.failure_threshold,
            synthetic_fallback = self.fallback.is_some(),
            "Resilience supervisor started"
        );

        let exit = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SupervisorExit::Shutdown,
                _ = ticker.tick() => {
                    let report = tokio::select! {
                        _ = shutdown.cancelled() => break SupervisorExit::Shutdown,
                        report = self.tick() => report,
                    };
                    if let Some(exit) = report.exit {
                        break exit;
                    }
                }
            }
        };

        self.shutdown().await;
        exit
    }

    /// 순서대로 종료합니다: 스트림 → 갭 복구 루프 → 처리기 flush → 시크릿 해제.
    pub async fn shutdown(&self) {
        info!("Ordered shutdown started");

        let collector = self.components.slot.current();
        collector.stop(collector.settings().stop_grace).await;
        collector.stats().log_summary("collector-total");

        let flushed = self.components.processor.shutdown(self.processor_grace).await;
        let stats = self.components.processor.stats();
        info!(
            flushed,
            written = stats.written,
            duplicates = stats.duplicates,
            write_failures = stats.write_failures,
            dropped_on_shutdown = stats.dropped_on_shutdown,
            "Processor flushed"
        );

        self.components.secrets.close();
        info!("Ordered shutdown complete");
    }
}
