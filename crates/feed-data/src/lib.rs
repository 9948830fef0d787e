//! 캔들 저장 및 수집 처리.
//!
//! 이 crate는 다음을 제공합니다:
//! - 캔들 저장소 계약과 TimescaleDB/인메모리 구현
//! - 프로세스 내 캔들 캐시 (degraded mode 합성 엔트리 포함)
//! - bounded 큐 기반 수집 처리기

pub mod cache;
pub mod error;
pub mod processor;
pub mod storage;

pub use cache::{CacheEntry, CacheSink, CacheStats, CandleCache};
pub use error::{DataError, Result};
pub use processor::{CandleFilter, IngestionProcessor, ProcessorStats};
pub use storage::{CandleStore, MemoryStore, TimescaleStore, WriteOutcome};
