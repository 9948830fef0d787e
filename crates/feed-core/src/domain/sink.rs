//! 캔들 수신자 trait.

use async_trait::async_trait;

use super::Candle;

/// 확정된 캔들을 전달받는 수신자.
///
/// 실데이터 경로에서는 수집 프로세서가, 축퇴 모드에서는 캐시가 구현합니다.
/// 구현체는 내부 오류를 스스로 기록하고 호출자에게 전파하지 않습니다.
#[async_trait]
pub trait CandleSink: Send + Sync {
    /// 캔들 하나를 받아들입니다. 큐가 가득 찬 경우 대기할 수 있습니다.
    async fn accept(&self, candle: Candle);
}
