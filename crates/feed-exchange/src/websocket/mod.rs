//! 거래소 WebSocket 스트림.

pub mod stream;

pub use stream::{
    kline_stream_name, kline_to_candle, parse_message, BinanceKlineStream, KlineEvent,
    StreamConfig, StreamMessage, SubscriptionHandle, WsKline,
};
