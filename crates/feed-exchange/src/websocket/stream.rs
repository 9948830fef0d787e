//! Binance kline WebSocket 스트림 클라이언트.
//!
//! 하나의 연결에 모든 (심볼, 타임프레임) 구독을 다중화합니다.
//!
//! - 확정된(closed) 캔들만 하위로 전달하고, 진행 중인 캔들 업데이트는 버립니다.
//! - 연결이 끊기면 상한이 있는 지수 백오프로 재연결하고 모든 활성 구독을 다시 보냅니다.
//! - 연속 `max_reconnect_attempts`회 연결에 실패하면 [`ExchangeError::ReconnectExhausted`]를
//!   반환합니다. 연결 직후 `stable_session`보다 빨리 끊긴 세션도 실패로 셉니다.
//!   구독을 조용히 잃지 않습니다.
//! - 잘못된 메시지는 기록 후 버리며 치명적으로 취급하지 않습니다.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use feed_core::{Candle, CandleSink, CandleSource, ExchangeConfig, SeriesKey, Symbol, Timeframe};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::{ExchangeResult, StreamStatusSnapshot};
use crate::ExchangeError;

// ============================================================================
// WebSocket 메시지 타입
// ============================================================================

/// Binance WebSocket 구독 메시지.
#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    method: &'a str,
    params: Vec<String>,
    id: u64,
}

/// Binance kline 스트림 이벤트.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: WsKline,
}

/// kline 본문.
#[derive(Debug, Clone, Deserialize)]
pub struct WsKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// 수신 메시지 종류.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    /// kline 업데이트 (진행 중 또는 확정)
    Kline(KlineEvent),
    /// SUBSCRIBE/UNSUBSCRIBE 응답
    SubscribeAck { id: u64 },
    /// 서버 에러 응답
    Error { code: i64, message: String },
    /// 처리하지 않는 메시지 (이벤트 타입)
    Unknown(String),
}

/// 텍스트 프레임을 [`StreamMessage`]로 파싱합니다.
///
/// combined stream 형식(`{"stream": ..., "data": {...}}`)도 풀어서 처리합니다.
pub fn parse_message(text: &str) -> ExchangeResult<StreamMessage> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    classify(value)
}

fn classify(value: serde_json::Value) -> ExchangeResult<StreamMessage> {
    if let Some(data) = value.get("data") {
        if value.get("stream").is_some() {
            return classify(data.clone());
        }
    }

    if let Some(event_type) = value.get("e").and_then(|e| e.as_str()) {
        return match event_type {
            "kline" => Ok(StreamMessage::Kline(serde_json::from_value(value)?)),
            other => Ok(StreamMessage::Unknown(other.to_string())),
        };
    }

    if let Some(error) = value.get("error") {
        return Ok(StreamMessage::Error {
            code: error.get("code").and_then(|c| c.as_i64()).unwrap_or_default(),
            message: error
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
        });
    }

    if let (Some(id), true) = (value.get("id").and_then(|i| i.as_u64()), value.get("result").is_some()) {
        return Ok(StreamMessage::SubscribeAck { id });
    }

    Ok(StreamMessage::Unknown("<untyped>".to_string()))
}

/// kline 이벤트를 캔들로 변환합니다.
///
/// 진행 중인 캔들은 `Ok(None)`. 심볼 인코딩, 타임프레임 태그, 숫자, 값 범위 중
/// 하나라도 잘못되면 에러입니다.
pub fn kline_to_candle(event: &KlineEvent, quote_assets: &[&str]) -> ExchangeResult<Option<Candle>> {
    let k = &event.kline;
    if !k.is_closed {
        return Ok(None);
    }

    if !event.symbol.eq_ignore_ascii_case(&k.symbol) {
        return Err(ExchangeError::InvalidSymbol(format!(
            "event symbol {} != kline symbol {}",
            event.symbol, k.symbol
        )));
    }
    let symbol = Symbol::from_exchange_format(&k.symbol, quote_assets)
        .ok_or_else(|| ExchangeError::InvalidSymbol(k.symbol.clone()))?;
    let timeframe = Timeframe::from_binance_interval(&k.interval)
        .ok_or_else(|| ExchangeError::ParseError(format!("unknown interval: {}", k.interval)))?;
    let open_time = DateTime::from_timestamp_millis(k.open_time)
        .ok_or_else(|| ExchangeError::ParseError(format!("bad open time: {}", k.open_time)))?;

    let candle = Candle::new(
        symbol,
        timeframe,
        open_time,
        parse_decimal("open", &k.open)?,
        parse_decimal("high", &k.high)?,
        parse_decimal("low", &k.low)?,
        parse_decimal("close", &k.close)?,
        parse_decimal("volume", &k.volume)?,
        CandleSource::Stream,
    );
    candle
        .validate()
        .map_err(|e| ExchangeError::ParseError(e.to_string()))?;

    Ok(Some(candle))
}

fn parse_decimal(field: &str, raw: &str) -> ExchangeResult<Decimal> {
    raw.parse()
        .map_err(|_| ExchangeError::ParseError(format!("invalid {}: {:?}", field, raw)))
}

/// Binance 스트림 이름 (예: `btcusdt@kline_5m`).
pub fn kline_stream_name(series: &SeriesKey) -> String {
    format!(
        "{}@kline_{}",
        series.symbol.to_exchange_format().to_lowercase(),
        series.timeframe.to_binance_interval()
    )
}

// ============================================================================
// 설정 / 상태
// ============================================================================

/// 스트림 클라이언트 설정.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL (raw stream 엔드포인트)
    pub ws_url: String,
    /// 연결 타임아웃
    pub connect_timeout: Duration,
    /// 재연결 초기 대기
    pub reconnect_initial: Duration,
    /// 재연결 대기 상한
    pub reconnect_max: Duration,
    /// 연속 연결 실패 허용 횟수
    pub max_reconnect_attempts: u32,
    /// 무수신 허용 시간 (초과 시 재연결)
    pub idle_timeout: Duration,
    /// 이보다 짧게 유지된 세션은 연결 실패로 셈
    pub stable_session: Duration,
    /// 심볼 인코딩 검증용 호가 자산
    pub quote_assets: Vec<String>,
}

impl From<&ExchangeConfig> for StreamConfig {
    fn from(config: &ExchangeConfig) -> Self {
        Self {
            ws_url: config.ws_base_url.clone(),
            connect_timeout: config.request_timeout(),
            reconnect_initial: Duration::from_millis(config.ws_reconnect_initial_ms),
            reconnect_max: Duration::from_millis(config.ws_reconnect_max_ms),
            max_reconnect_attempts: config.ws_max_reconnect_attempts.max(1),
            idle_timeout: config.ws_idle_timeout(),
            stable_session: config.ws_stable_session(),
            quote_assets: config.quote_assets.clone(),
        }
    }
}

impl StreamConfig {
    /// `failures`번 연속 실패 후의 재연결 대기 (상한 적용).
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.reconnect_initial
            .saturating_mul(factor)
            .min(self.reconnect_max)
    }
}

#[derive(Default)]
struct StreamStatus {
    connected: AtomicBool,
    reconnects: AtomicU64,
    consecutive_failures: AtomicU32,
    candles_emitted: AtomicU64,
    malformed_messages: AtomicU64,
    last_message_ms: AtomicI64,
}

impl StreamStatus {
    fn snapshot(&self) -> StreamStatusSnapshot {
        let last_ms = self.last_message_ms.load(Ordering::Relaxed);
        StreamStatusSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            candles_emitted: self.candles_emitted.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            last_message_at: (last_ms > 0)
                .then(|| DateTime::from_timestamp_millis(last_ms))
                .flatten(),
        }
    }
}

/// 구독 핸들.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub series: SeriesKey,
    stream_name: String,
}

impl SubscriptionHandle {
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

enum StreamCommand {
    Subscribe(String),
    Unsubscribe(String),
}

enum SessionEnd {
    Shutdown,
    Lost,
}

// ============================================================================
// 스트림 클라이언트
// ============================================================================

/// Binance kline 스트림 클라이언트.
pub struct BinanceKlineStream {
    config: StreamConfig,
    subscriptions: RwLock<BTreeMap<String, SeriesKey>>,
    sink: RwLock<Option<Arc<dyn CandleSink>>>,
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamCommand>>>,
    status: StreamStatus,
    message_id: AtomicU64,
}

impl BinanceKlineStream {
    /// 새 스트림 클라이언트를 생성합니다.
    pub fn new(config: StreamConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            config,
            subscriptions: RwLock::new(BTreeMap::new()),
            sink: RwLock::new(None),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            status: StreamStatus::default(),
            message_id: AtomicU64::new(1),
        }
    }

    /// 확정 캔들을 받을 수신자를 등록합니다.
    pub fn on_candle(&self, sink: Arc<dyn CandleSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// 시계열을 구독합니다. 실행 중이면 즉시 SUBSCRIBE를 보냅니다.
    pub fn subscribe(&self, symbol: Symbol, timeframe: Timeframe) -> ExchangeResult<SubscriptionHandle> {
        let quotes = self.quote_refs();
        let encoded = symbol.to_exchange_format();
        if Symbol::from_exchange_format(&encoded, &quotes).as_ref() != Some(&symbol) {
            return Err(ExchangeError::InvalidSymbol(symbol.to_string()));
        }

        let series = SeriesKey::new(symbol, timeframe);
        let stream_name = kline_stream_name(&series);
        let inserted = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream_name.clone(), series.clone())
            .is_none();

        if inserted {
            info!(series = %series, stream = %stream_name, "Subscribed");
            // 실행 중이 아니면 다음 연결 시 일괄 구독됨
            let _ = self.cmd_tx.send(StreamCommand::Subscribe(stream_name.clone()));
        }

        Ok(SubscriptionHandle {
            series,
            stream_name,
        })
    }

    /// 구독을 해제합니다.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.stream_name)
            .is_some();

        if removed {
            info!(series = %handle.series, "Unsubscribed");
            let _ = self
                .cmd_tx
                .send(StreamCommand::Unsubscribe(handle.stream_name.clone()));
        }
    }

    /// 활성 구독 목록.
    pub fn active_series(&self) -> Vec<SeriesKey> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// 연결 상태 스냅샷.
    pub fn status(&self) -> StreamStatusSnapshot {
        self.status.snapshot()
    }

    /// 연결/재연결 루프를 실행합니다.
    ///
    /// `shutdown` 취소 시 `Ok(())`, 연속 연결 실패가 한도를 넘으면
    /// `ReconnectExhausted`를 반환합니다. 반환 후 다시 호출할 수 있습니다.
    pub async fn run(&self, shutdown: CancellationToken) -> ExchangeResult<()> {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ExchangeError::Unknown("stream is already running".to_string()))?;

        let result = self.run_sessions(&shutdown, &mut cmd_rx).await;

        self.status.connected.store(false, Ordering::Relaxed);
        *self.cmd_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(cmd_rx);
        result
    }

    async fn run_sessions(
        &self,
        shutdown: &CancellationToken,
        cmd_rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    ) -> ExchangeResult<()> {
        let mut failures: u32 = 0;
        let mut first = true;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            if !first {
                let delay = self.config.reconnect_delay(failures.saturating_sub(1));
                debug!(delay_ms = delay.as_millis() as u64, failures, "Waiting before reconnect");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                self.status.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            first = false;

            let started = Instant::now();
            match self.session(shutdown, cmd_rx).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Lost) if started.elapsed() >= self.config.stable_session => {
                    // 안정적으로 유지됐던 세션: 실패 카운트 초기화 후 재연결
                    failures = 0;
                }
                Ok(SessionEnd::Lost) => {
                    failures += 1;
                    warn!(
                        lasted_ms = started.elapsed().as_millis() as u64,
                        failures,
                        max = self.config.max_reconnect_attempts,
                        "WebSocket session dropped right after connect"
                    );
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        error = %e,
                        failures,
                        max = self.config.max_reconnect_attempts,
                        "WebSocket connect failed"
                    );
                }
            }
            self.status
                .consecutive_failures
                .store(failures, Ordering::Relaxed);
            if failures > 0 && failures >= self.config.max_reconnect_attempts {
                return Err(ExchangeError::ReconnectExhausted { attempts: failures });
            }
        }
    }

    /// 한 번의 연결 세션. 연결 자체가 실패하면 `Err`.
    async fn session(
        &self,
        shutdown: &CancellationToken,
        cmd_rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    ) -> ExchangeResult<SessionEnd> {
        info!(url = %self.config.ws_url, "Connecting to kline stream");
        let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(&self.config.ws_url));
        let (ws, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            result = connect => result
                .map_err(|_| ExchangeError::Timeout("websocket connect".to_string()))??,
        };

        self.status.connected.store(true, Ordering::Relaxed);
        self.status.consecutive_failures.store(0, Ordering::Relaxed);
        let (mut write, mut read) = ws.split();

        // 연결 시점의 구독을 모두 다시 보냄; 이전에 쌓인 명령은 중복이므로 비움
        while cmd_rx.try_recv().is_ok() {}
        let streams: Vec<String> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        if !streams.is_empty() {
            info!(count = streams.len(), "Re-issuing subscriptions");
            if let Err(e) = write.send(self.control_frame("SUBSCRIBE", streams)?).await {
                warn!(error = %e, "Failed to send SUBSCRIBE");
                self.status.connected.store(false, Ordering::Relaxed);
                return Ok(SessionEnd::Lost);
            }
        }

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                Some(cmd) = cmd_rx.recv() => {
                    let frame = match cmd {
                        StreamCommand::Subscribe(name) => self.control_frame("SUBSCRIBE", vec![name])?,
                        StreamCommand::Unsubscribe(name) => self.control_frame("UNSUBSCRIBE", vec![name])?,
                    };
                    if let Err(e) = write.send(frame).await {
                        warn!(error = %e, "Failed to send control frame");
                        break SessionEnd::Lost;
                    }
                }
                next = tokio::time::timeout(self.config.idle_timeout, read.next()) => {
                    match next {
                        Err(_) => {
                            warn!(idle_secs = self.config.idle_timeout.as_secs(), "No messages, reconnecting");
                            break SessionEnd::Lost;
                        }
                        Ok(None) => {
                            info!("WebSocket stream ended");
                            break SessionEnd::Lost;
                        }
                        Ok(Some(Err(e))) => {
                            warn!(error = %e, "WebSocket read error");
                            break SessionEnd::Lost;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.status.last_message_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                            self.handle_text(&text).await;
                        }
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            // Pong은 tungstenite가 자동 응답
                            self.status.last_message_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        }
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            info!(frame = ?frame, "WebSocket closed by server");
                            break SessionEnd::Lost;
                        }
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        };

        self.status.connected.store(false, Ordering::Relaxed);
        Ok(end)
    }

    async fn handle_text(&self, text: &str) {
        let event = match parse_message(text) {
            Ok(StreamMessage::Kline(event)) => event,
            Ok(StreamMessage::SubscribeAck { id }) => {
                debug!(id, "Subscription acknowledged");
                return;
            }
            Ok(StreamMessage::Error { code, message }) => {
                warn!(code, message = %message, "Stream error response");
                return;
            }
            Ok(StreamMessage::Unknown(kind)) => {
                debug!(kind = %kind, "Ignoring message");
                return;
            }
            Err(e) => {
                self.status.malformed_messages.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, payload = %truncate(text, 200), "Discarding malformed message");
                return;
            }
        };

        let candle = match kline_to_candle(&event, &self.quote_refs()) {
            Ok(Some(candle)) => candle,
            Ok(None) => return,
            Err(e) => {
                self.status.malformed_messages.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, symbol = %event.symbol, "Discarding invalid kline");
                return;
            }
        };

        let subscribed = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kline_stream_name(&candle.series()));
        if !subscribed {
            debug!(series = %candle.series(), "Kline for inactive subscription dropped");
            return;
        }

        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => {
                self.status.candles_emitted.fetch_add(1, Ordering::Relaxed);
                sink.accept(candle).await;
            }
            None => warn!(series = %candle.series(), "Closed candle without registered handler"),
        }
    }

    fn control_frame(&self, method: &str, params: Vec<String>) -> ExchangeResult<Message> {
        let msg = SubscribeMessage {
            method,
            params,
            id: self.message_id.fetch_add(1, Ordering::Relaxed),
        };
        Ok(Message::Text(serde_json::to_string(&msg)?.into()))
    }

    fn quote_refs(&self) -> Vec<&str> {
        self.config.quote_assets.iter().map(String::as_str).collect()
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
