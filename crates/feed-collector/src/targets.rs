//! 수집 대상 시계열 결정.
//!
//! 시크릿 저장소에 심볼/타임프레임 목록이 있으면 그것을, 없으면 설정 파일 값을 씁니다.

use std::collections::BTreeSet;

use feed_core::{CollectorConfig, SeriesKey, Symbol, Timeframe};
use tracing::info;

use crate::error::{CollectorError, Result};
use crate::secrets::{SecretsClient, SecretsError};

/// 수집 대상 시계열 목록 (심볼 × 타임프레임).
pub async fn resolve_series(secrets: &SecretsClient, config: &CollectorConfig) -> Result<Vec<SeriesKey>> {
    let symbols: Vec<Symbol> = match lookup_list(secrets, &config.symbols_secret).await? {
        Some(raw) => raw
            .iter()
            .map(|s| s.parse())
            .collect::<std::result::Result<_, _>>()?,
        None => config.symbols.clone(),
    };
    let timeframes: Vec<Timeframe> = match lookup_list(secrets, &config.timeframes_secret).await? {
        Some(raw) => raw
            .iter()
            .map(|s| s.parse())
            .collect::<std::result::Result<_, _>>()?,
        None => config.timeframes.clone(),
    };

    let series: BTreeSet<SeriesKey> = symbols
        .iter()
        .flat_map(|symbol| {
            timeframes
                .iter()
                .map(move |tf| SeriesKey::new(symbol.clone(), *tf))
        })
        .collect();

    if series.is_empty() {
        return Err(CollectorError::Config(
            "no symbols or timeframes configured".to_string(),
        ));
    }

    info!(
        symbols = symbols.len(),
        timeframes = timeframes.len(),
        series = series.len(),
        "Collection targets resolved"
    );
    Ok(series.into_iter().collect())
}

async fn lookup_list(secrets: &SecretsClient, key: &str) -> Result<Option<Vec<String>>> {
    match secrets.get_list(key).await {
        Ok(list) => Ok(Some(list)),
        Err(SecretsError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
