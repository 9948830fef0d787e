//! # Feed Core
//!
//! 시세 수집 파이프라인의 핵심 도메인 모델 및 타입을 제공합니다.
//!
//! - 캔들(OHLCV)과 데이터 출처 태그
//! - 심볼 및 타임프레임 정의
//! - 캔들 수신자 trait
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod types;

pub use self::config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use types::*;
