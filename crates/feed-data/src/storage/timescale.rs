//! TimescaleDB 캔들 저장소.
//!
//! TimescaleDB(PostgreSQL + TimescaleDB 확장)의 `ohlcv` 테이블에 캔들을 저장합니다.
//! 행은 `ON CONFLICT DO NOTHING`으로 삽입되므로 한 번 저장된 캔들은 바뀌지 않습니다.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSource, DatabaseConfig, SeriesKey, Symbol, Timeframe};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument, warn};

use super::{CandleStore, WriteOutcome};
use crate::error::{DataError, Result};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ohlcv (
    symbol      TEXT        NOT NULL,
    timeframe   TEXT        NOT NULL,
    open_time   TIMESTAMPTZ NOT NULL,
    open        NUMERIC     NOT NULL,
    high        NUMERIC     NOT NULL,
    low         NUMERIC     NOT NULL,
    close       NUMERIC     NOT NULL,
    volume      NUMERIC     NOT NULL,
    source      TEXT        NOT NULL,
    written_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (symbol, timeframe, open_time)
)
"#;

const CREATE_HYPERTABLE: &str =
    "SELECT create_hypertable('ohlcv', 'open_time', if_not_exists => TRUE, migrate_data => TRUE)";

/// OHLCV 데이터베이스 레코드.
#[derive(Debug, Clone, FromRow)]
pub struct OhlcvRecord {
    pub symbol: String,
    pub timeframe: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub source: String,
}

impl OhlcvRecord {
    /// 도메인 캔들로 변환합니다.
    pub fn into_candle(self) -> Result<Candle> {
        let symbol = Symbol::from_string(&self.symbol)
            .ok_or_else(|| DataError::InvalidData(format!("bad symbol: {}", self.symbol)))?;
        let timeframe: Timeframe = self.timeframe.parse()?;
        let source: CandleSource = self.source.parse()?;

        Ok(Candle::new(
            symbol,
            timeframe,
            self.open_time,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            source,
        ))
    }
}

/// TimescaleDB 저장소.
#[derive(Clone)]
pub struct TimescaleStore {
    pool: PgPool,
}

impl TimescaleStore {
    /// 새로운 연결 풀을 생성합니다.
    ///
    /// `url`은 시크릿에서 조회한 값을 우선 사용하도록 호출자가 넘겨줍니다.
    pub async fn connect(config: &DatabaseConfig, url: &str) -> Result<Self> {
        info!(
            max_connections = config.max_connections,
            "Connecting to database..."
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| DataError::ConnectionError(e.to_string()))?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    /// 기존 연결 풀에서 생성합니다.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `ohlcv` 테이블을 준비합니다.
    ///
    /// TimescaleDB 확장이 없으면 일반 테이블로 동작합니다.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| DataError::SchemaError(e.to_string()))?;

        if let Err(e) = sqlx::query(CREATE_HYPERTABLE).execute(&self.pool).await {
            warn!(error = %e, "Hypertable not created, continuing with a plain table");
        }

        info!("Schema ready");
        Ok(())
    }
}

#[async_trait]
impl CandleStore for TimescaleStore {
    fn name(&self) -> &str {
        "timescaledb"
    }

    #[instrument(skip(self, candle), fields(key = %candle.key()))]
    async fn write(&self, candle: &Candle) -> Result<WriteOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO ohlcv
                (symbol, timeframe, open_time, open, high, low, close, volume, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (symbol, timeframe, open_time) DO NOTHING
            "#,
        )
        .bind(candle.symbol.to_standard_string())
        .bind(candle.timeframe.to_string())
        .bind(candle.open_time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .bind(candle.source.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| match DataError::from(e) {
            DataError::QueryError(msg) => DataError::InsertError(msg),
            other => other,
        })?;

        let outcome = if result.rows_affected() == 0 {
            WriteOutcome::Duplicate
        } else {
            WriteOutcome::Inserted
        };
        debug!(?outcome, "Candle written");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn last_candle(&self, series: &SeriesKey) -> Result<Option<Candle>> {
        let record: Option<OhlcvRecord> = sqlx::query_as(
            r#"
            SELECT symbol, timeframe, open_time, open, high, low, close, volume, source
            FROM ohlcv
            WHERE symbol = $1 AND timeframe = $2
            ORDER BY open_time DESC
            LIMIT 1
            "#,
        )
        .bind(series.symbol.to_standard_string())
        .bind(series.timeframe.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record.map(OhlcvRecord::into_candle).transpose()
    }

    #[instrument(skip(self))]
    async fn range(
        &self,
        series: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let records: Vec<OhlcvRecord> = sqlx::query_as(
            r#"
            SELECT symbol, timeframe, open_time, open, high, low, close, volume, source
            FROM ohlcv
            WHERE symbol = $1 AND timeframe = $2 AND open_time >= $3 AND open_time < $4
            ORDER BY open_time ASC
            "#,
        )
        .bind(series.symbol.to_standard_string())
        .bind(series.timeframe.to_string())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(OhlcvRecord::into_candle).collect()
    }

    #[instrument(skip(self))]
    async fn count(&self, series: &SeriesKey) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM ohlcv
            WHERE symbol = $1 AND timeframe = $2
            "#,
        )
        .bind(series.symbol.to_standard_string())
        .bind(series.timeframe.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn record() -> OhlcvRecord {
        OhlcvRecord {
            symbol: "BTC/USDT".into(),
            timeframe: "5m".into(),
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close: dec!(105),
            volume: dec!(1.5),
            source: "gap-fill".into(),
        }
    }

    #[test]
    fn test_record_into_candle() {
        let candle = record().into_candle().unwrap();
        assert_eq!(candle.symbol, Symbol::new("BTC", "USDT"));
        assert_eq!(candle.timeframe, Timeframe::M5);
        assert_eq!(candle.source, CandleSource::GapFill);
        assert_eq!(candle.close, dec!(105));
    }

    #[test]
    fn test_record_with_bad_columns_is_rejected() {
        let mut bad = record();
        bad.symbol = "BTCUSDT".into();
        assert!(matches!(bad.into_candle(), Err(DataError::InvalidData(_))));

        let mut bad = record();
        bad.source = "mock".into();
        assert!(bad.into_candle().is_err());
    }
}
