//! 시장 데이터 수집기.
//!
//! 실시간 스트림과 갭 복구를 함께 돌리는 수집기, 의존성 헬스 체크,
//! 그리고 circuit breaker 기반 복원력 감독자를 제공합니다:
//! - 콜드 스타트 백필 / 주기적 갭 복구 (`collector`)
//! - 시크릿 / 저장소 / 신선도 / 메모리 / 스트림 / 과거 조회 헬스 체크 (`health`)
//! - 표적 복구, 에스컬레이션, degraded mode (`supervisor`)

pub mod collector;
pub mod error;
pub mod health;
pub mod liveness;
pub mod secrets;
pub mod stats;
pub mod supervisor;
pub mod targets;

pub use collector::{
    find_interior_gap, plan_heal, Collector, CollectorSettings, CollectorSlot, HealPlan,
    HealReport, StreamState,
};
pub use error::{CollectorError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, Dependency, FetchProbe, HealthChecker, HealthProbe,
    HealthStatus,
};
pub use liveness::{Heartbeat, LivenessMarker};
pub use secrets::{FileSecretStore, SecretStore, SecretsClient, SecretsError, SecretsHealth};
pub use stats::CollectionStats;
pub use supervisor::{
    RecoveryAction, ResilienceSupervisor, SupervisedComponents, SupervisorExit, SupervisorMode,
    TickReport,
};
pub use targets::resolve_series;
