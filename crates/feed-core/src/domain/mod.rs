//! 시세 수집 도메인 모델.

mod candle;
mod sink;

pub use candle::*;
pub use sink::*;
