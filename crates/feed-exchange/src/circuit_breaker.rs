//! Circuit Breaker.
//!
//! 실패하는 의존성(거래소 REST, 저장소, 시크릿 등)에 대한 반복 시도를
//! 일정 시간 멈추게 하는 실패 카운팅 상태 머신입니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[연속 실패 ≥ 임계치]──> Open
//!    ↑                              │
//!    │                     [reset_timeout 경과]
//!    │                              ↓
//!    └──[프로브 성공]── HalfOpen ──[프로브 실패]──> Open (타임아웃 재시작)
//! ```
//!
//! - 실패는 Closed 상태에서만 누적됩니다.
//! - Open 상태에서는 모든 호출이 거부됩니다.
//! - HalfOpen 상태에서는 동시에 단 하나의 프로브만 허용됩니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ExchangeError;

/// 에러 카테고리.
///
/// 카테고리별로 다른 임계치를 적용할 때 사용합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 네트워크/연결 오류
    Network,
    /// 요청 한도 초과
    RateLimit,
    /// 타임아웃
    Timeout,
    /// 5xx 등 서비스 측 오류
    Service,
}

impl ErrorCategory {
    /// ExchangeError에서 카테고리 추출.
    ///
    /// 재시도 대상이 아닌 에러(파싱, 잘못된 심볼 등)는 의존성 장애로 보지 않으므로 `None`.
    pub fn from_error(error: &ExchangeError) -> Option<Self> {
        match error {
            ExchangeError::NetworkError(_)
            | ExchangeError::Disconnected(_)
            | ExchangeError::WebSocket(_)
            | ExchangeError::ReconnectExhausted { .. } => Some(ErrorCategory::Network),
            ExchangeError::RateLimited { .. } => Some(ErrorCategory::RateLimit),
            ExchangeError::Timeout(_) => Some(ErrorCategory::Timeout),
            ExchangeError::ServerError { .. } | ExchangeError::FetchUnavailable { .. } => {
                Some(ErrorCategory::Service)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Service => "service",
        };
        f.write_str(s)
    }
}

/// 에러 카테고리별 임계치.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryThresholds {
    pub network: u32,
    /// rate limit은 더 관대하게
    pub rate_limit: u32,
    pub timeout: u32,
    pub service: u32,
}

impl Default for CategoryThresholds {
    fn default() -> Self {
        Self {
            network: 5,
            rate_limit: 10,
            timeout: 5,
            service: 5,
        }
    }
}

impl CategoryThresholds {
    pub fn get(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::Network => self.network,
            ErrorCategory::RateLimit => self.rate_limit,
            ErrorCategory::Timeout => self.timeout,
            ErrorCategory::Service => self.service,
        }
    }
}

/// Circuit Breaker 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 정상 - 호출 허용
    Closed,
    /// 장애 - 호출 거부
    Open,
    /// 복구 확인 - 단일 프로브만 허용
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit Breaker 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 연속 실패 임계치 (카테고리 없이 기록된 실패에 적용)
    pub failure_threshold: u32,
    /// Open 유지 시간 (밀리초)
    pub reset_timeout_ms: u64,
    /// HalfOpen → Closed에 필요한 연속 프로브 성공 횟수
    pub success_threshold: u32,
    /// 카테고리별 임계치
    #[serde(default)]
    pub category_thresholds: Option<CategoryThresholds>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 1,
            category_thresholds: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// 새 설정 생성.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout_ms: reset_timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    /// 카테고리별 임계치 설정 추가.
    pub fn with_category_thresholds(mut self, thresholds: CategoryThresholds) -> Self {
        self.category_thresholds = Some(thresholds);
        self
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// 특정 카테고리의 임계치 조회.
    pub fn threshold_for(&self, category: ErrorCategory) -> u32 {
        self.category_thresholds
            .as_ref()
            .map(|t| t.get(category))
            .unwrap_or(self.failure_threshold)
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    probe_successes: u32,
    probe_in_flight: bool,
    last_transition: Instant,
    last_transition_at: DateTime<Utc>,
    category_failures: HashMap<ErrorCategory, u32>,
    tripped_by: Option<ErrorCategory>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            probe_successes: 0,
            probe_in_flight: false,
            last_transition: Instant::now(),
            last_transition_at: Utc::now(),
            category_failures: HashMap::new(),
            tripped_by: None,
        }
    }
}

/// Circuit Breaker.
///
/// ```ignore
/// let cb = CircuitBreaker::new("storage", CircuitBreakerConfig::default());
///
/// if cb.is_allowed() {
///     match store.health_check().await {
///         Ok(_) => cb.record_success(),
///         Err(_) => cb.record_failure(),
///     }
/// }
/// ```
///
/// `is_allowed()`가 HalfOpen에서 `true`를 반환했다면 호출자는 반드시
/// `record_success`/`record_failure`/`release_probe` 중 하나를 호출해야 합니다.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    open_count: AtomicU64,
    probe_count: AtomicU64,
}

impl CircuitBreaker {
    /// 새 Circuit Breaker 생성.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(BreakerState::new()),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
        }
    }

    /// 기본 설정으로 생성.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn write(&self) -> RwLockWriteGuard<'_, BreakerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 현재 상태 반환 (Open 타임아웃이 지났으면 HalfOpen으로 전이).
    pub fn state(&self) -> CircuitState {
        let mut state = self.write();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// 호출이 허용되는지 확인.
    ///
    /// HalfOpen에서는 진행 중인 프로브가 없을 때만 한 번 허용하고,
    /// 그 결과가 기록될 때까지 이후 호출은 거부합니다.
    pub fn is_allowed(&self) -> bool {
        let mut state = self.write();
        self.maybe_half_open(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    self.probe_count.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(circuit_breaker = %self.name, "Half-open probe admitted");
                    true
                }
            }
        }
    }

    /// 결과를 기록하지 않고 프로브 허가를 반납합니다 (프로브가 취소된 경우).
    pub fn release_probe(&self) {
        self.write().probe_in_flight = false;
    }

    /// 성공 기록.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.write();

        match state.state {
            CircuitState::HalfOpen => {
                state.probe_in_flight = false;
                state.probe_successes += 1;
                if state.probe_successes >= self.config.success_threshold.max(1) {
                    self.transition_to(&mut state, CircuitState::Closed);
                    tracing::info!(
                        circuit_breaker = %self.name,
                        "Circuit breaker recovered: HalfOpen -> Closed"
                    );
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
                state.category_failures.clear();
                state.tripped_by = None;
            }
            CircuitState::Open => {}
        }
    }

    /// 실패 기록 (기본 임계치 사용).
    pub fn record_failure(&self) {
        self.record_failure_internal(None);
    }

    /// 카테고리를 지정한 실패 기록.
    pub fn record_failure_with_category(&self, category: ErrorCategory) {
        self.record_failure_internal(Some(category));
    }

    fn record_failure_internal(&self, category: Option<ErrorCategory>) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.write();

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;

                let tripped = match category {
                    Some(cat) => {
                        let count = {
                            let entry = state.category_failures.entry(cat).or_insert(0);
                            *entry += 1;
                            *entry
                        };
                        count >= self.config.threshold_for(cat)
                    }
                    None => state.failure_count >= self.config.failure_threshold.max(1),
                };

                if tripped {
                    state.tripped_by = category;
                    self.transition_to(&mut state, CircuitState::Open);
                    self.open_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        circuit_breaker = %self.name,
                        failure_count = state.failure_count,
                        tripped_by = ?category,
                        "Circuit breaker tripped: Closed -> Open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.tripped_by = category.or(state.tripped_by);
                self.transition_to(&mut state, CircuitState::Open);
                self.open_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    circuit_breaker = %self.name,
                    "Circuit breaker probe failed: HalfOpen -> Open"
                );
            }
            // Open에서는 누적하지 않음
            CircuitState::Open => {}
        }
    }

    /// ExchangeError 기반 결과 기록.
    ///
    /// 의존성 장애로 분류되지 않는 에러는 상태에 영향을 주지 않지만,
    /// HalfOpen 프로브였다면 허가는 반납합니다.
    pub fn record_result<T>(&self, result: &Result<T, ExchangeError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) => match ErrorCategory::from_error(e) {
                Some(category) => self.record_failure_with_category(category),
                None => self.release_probe(),
            },
        }
    }

    /// 수동으로 Closed로 리셋.
    pub fn reset(&self) {
        let mut state = self.write();
        self.transition_to(&mut state, CircuitState::Closed);
        tracing::info!(circuit_breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Open 상태라면 HalfOpen까지 남은 시간.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let state = self.write();
        (state.state == CircuitState::Open)
            .then(|| self.config.reset_timeout().saturating_sub(state.last_transition.elapsed()))
    }

    /// 메트릭 스냅샷.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut state = self.write();
        self.maybe_half_open(&mut state);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            probe_count: self.probe_count.load(Ordering::Relaxed),
            last_transition_at: state.last_transition_at,
            time_in_current_state: state.last_transition.elapsed(),
            tripped_by: state.tripped_by,
        }
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open
            && state.last_transition.elapsed() >= self.config.reset_timeout()
        {
            self.transition_to(state, CircuitState::HalfOpen);
            tracing::info!(
                circuit_breaker = %self.name,
                "Circuit breaker timeout: Open -> HalfOpen"
            );
        }
    }

    fn transition_to(&self, state: &mut BreakerState, new_state: CircuitState) {
        state.state = new_state;
        state.last_transition = Instant::now();
        state.last_transition_at = Utc::now();
        state.probe_in_flight = false;
        state.probe_successes = 0;

        if new_state == CircuitState::Closed {
            state.failure_count = 0;
            state.category_failures.clear();
            state.tripped_by = None;
        }
    }
}

/// Circuit Breaker 메트릭.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// 현재 연속 실패 횟수
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Open 전이 횟수
    pub open_count: u64,
    /// 허용된 HalfOpen 프로브 수
    pub probe_count: u64,
    pub last_transition_at: DateTime<Utc>,
    pub time_in_current_state: Duration,
    pub tripped_by: Option<ErrorCategory>,
}
