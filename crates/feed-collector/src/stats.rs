//! 수집 통계 구조체.

use serde::Serialize;
use std::time::Duration;

/// 갭 복구 패스 통계
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    /// 점검한 시계열 수
    pub total: usize,
    /// 콜드 스타트 백필을 수행한 시계열 수
    pub backfilled: usize,
    /// 갭을 복구한 시계열 수
    pub gap_healed: usize,
    /// 이미 최신인 시계열 수
    pub up_to_date: usize,
    /// 스트리밍 전용 모드로 건너뛴 시계열 수
    pub skipped: usize,
    /// 에러 횟수
    pub errors: usize,
    /// 조회된 캔들 수
    pub fetched: usize,
    /// 큐에 넣은 캔들 수
    pub enqueued: usize,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl CollectionStats {
    /// 새 통계 객체 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 성공률 계산 (%)
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            ((self.total - self.errors) as f64 / self.total as f64) * 100.0
        }
    }

    /// 다른 통계를 누적합니다.
    pub fn merge(&mut self, other: &CollectionStats) {
        self.total += other.total;
        self.backfilled += other.backfilled;
        self.gap_healed += other.gap_healed;
        self.up_to_date += other.up_to_date;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.fetched += other.fetched;
        self.enqueued += other.enqueued;
        self.elapsed += other.elapsed;
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            total = self.total,
            backfilled = self.backfilled,
            gap_healed = self.gap_healed,
            up_to_date = self.up_to_date,
            skipped = self.skipped,
            errors = self.errors,
            fetched = self.fetched,
            enqueued = self.enqueued,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "수집 완료"
        );
    }
}
