//! 에러 타입 정의.

use feed_core::CoreError;
use feed_data::DataError;
use feed_exchange::ExchangeError;
use thiserror::Error;

use crate::secrets::SecretsError;

/// Collector 에러 타입
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 데이터 소스 에러 (과거 조회, 스트림)
    #[error("Data source error: {0}")]
    DataSource(#[from] ExchangeError),

    /// 저장소/처리기 에러
    #[error("Storage error: {0}")]
    Storage(#[from] DataError),

    /// 시크릿 조회 에러
    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    /// 이미 실행 중이거나 중지된 상태에서의 잘못된 호출
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<CoreError> for CollectorError {
    fn from(err: CoreError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;
