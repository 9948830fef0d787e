//! 시세 수집 도메인의 핵심 에러 타입.

use thiserror::Error;

/// 핵심 도메인 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 캔들 검증 실패
    #[error("잘못된 캔들 ({key}): {reason}")]
    InvalidCandle { key: String, reason: String },

    /// 심볼 형식 오류
    #[error("잘못된 심볼: {0}")]
    InvalidSymbol(String),

    /// 타임프레임 형식 오류
    #[error("잘못된 타임프레임: {0}")]
    InvalidTimeframe(String),

    /// 데이터 출처 태그 오류
    #[error("잘못된 데이터 출처: {0}")]
    InvalidSource(String),
}

/// 핵심 작업을 위한 Result 타입.
pub type CoreResult<T> = Result<T, CoreError>;

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}
