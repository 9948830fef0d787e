//! 합성(simulated) 데이터.
//!
//! 실데이터 수집이 완전히 실패했을 때의 최후 수단으로만 쓰이는 degraded mode용입니다.
//! 생성된 캔들은 모두 `source=synthetic`으로 표시되어 실데이터와 구분됩니다.

mod generator;
mod source;

pub use generator::SyntheticCandleGenerator;
pub use source::SyntheticDataSource;
