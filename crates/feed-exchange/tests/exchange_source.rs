//! ExchangeDataSource 통합 테스트.
//!
//! mockito REST 서버와 로컬 WebSocket 서버를 상대로 과거 조회와 스트림을 확인합니다.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use feed_core::{Candle, CandleSink, CandleSource, ExchangeConfig, SeriesKey, Symbol, Timeframe};
use feed_exchange::{DataSource, ExchangeDataSource, HistoricalDataProvider};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CollectingSink {
    candles: Mutex<Vec<Candle>>,
}

#[async_trait]
impl CandleSink for CollectingSink {
    async fn accept(&self, candle: Candle) {
        self.candles.lock().unwrap().push(candle);
    }
}

fn exchange_config(rest: String, ws: String) -> ExchangeConfig {
    ExchangeConfig {
        rest_base_url: rest,
        ws_base_url: ws,
        min_request_interval_ms: 0,
        max_attempts: 2,
        retry_initial_delay_ms: 5,
        retry_max_delay_ms: 10,
        ws_reconnect_initial_ms: 10,
        ws_reconnect_max_ms: 20,
        ws_max_reconnect_attempts: 2,
        ..ExchangeConfig::default()
    }
}

#[tokio::test]
async fn test_fetch_range_through_data_source() {
    let mut server = mockito::Server::new_async().await;
    let open = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let ms = open.timestamp_millis();
    let body = serde_json::json!([
        [ms, "10.0", "12.0", "9.5", "11.0", "100", ms + 3_599_999, "0", 1, "0", "0", "0"]
    ]);
    server
        .mock("GET", "/api/v3/klines")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(body.to_string())
        .create_async()
        .await;

    let source = ExchangeDataSource::from_config(
        &exchange_config(server.url(), "ws://127.0.0.1:1".into()),
        None,
    )
    .unwrap();

    let candles = source
        .fetch_range(&Symbol::new("SOL", "USDT"), Timeframe::H1, open, open, None)
        .await
        .unwrap();

    assert_eq!(source.name(), "binance");
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].source, CandleSource::Backfill);
    assert_eq!(candles[0].symbol, Symbol::new("SOL", "USDT"));
}

#[tokio::test]
async fn test_stream_delivers_closed_candles_for_requested_series() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let subscribe = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            other => panic!("expected subscribe, got {:?}", other),
        };

        let kline = |symbol: &str, interval: &str| {
            serde_json::json!({
                "e": "kline", "E": 1_709_294_460_000i64, "s": symbol,
                "k": {
                    "t": 1_709_294_400_000i64, "T": 1_709_294_459_999i64, "s": symbol, "i": interval,
                    "o": "1.0", "c": "1.1", "h": "1.2", "l": "0.9", "v": "5", "x": true
                }
            })
            .to_string()
        };
        // 구독하지 않은 시계열은 전달되지 않아야 함
        for frame in [kline("ETHUSDT", "1m"), kline("BTCUSDT", "1m")] {
            ws.send(Message::Text(frame.into())).await.unwrap();
        }
        // 클라이언트가 종료할 때까지 대기
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
        subscribe
    });

    let source = Arc::new(
        ExchangeDataSource::from_config(
            &exchange_config("http://127.0.0.1:1".into(), format!("ws://{}", addr)),
            None,
        )
        .unwrap(),
    );
    let sink = Arc::new(CollectingSink::default());
    let shutdown = CancellationToken::new();

    let task = {
        let source = source.clone();
        let sink: Arc<dyn CandleSink> = sink.clone();
        let shutdown = shutdown.clone();
        let series = vec![SeriesKey::new(Symbol::new("BTC", "USDT"), Timeframe::M1)];
        tokio::spawn(async move { source.stream(series, sink, shutdown).await })
    };

    for _ in 0..100 {
        if !sink.candles.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    task.await.unwrap().unwrap();
    let subscribe = server.await.unwrap();

    assert!(subscribe.contains("btcusdt@kline_1m"));
    let candles = sink.candles.lock().unwrap();
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].symbol, Symbol::new("BTC", "USDT"));
    assert_eq!(candles[0].source, CandleSource::Stream);
    assert_eq!(source.stream_status().unwrap().candles_emitted, 1);
}
