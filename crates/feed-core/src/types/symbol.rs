//! 심볼 정의.
//!
//! 내부 표준 형식은 `BASE/QUOTE`이며, 거래소별 인코딩(예: `BTCUSDT`)과의
//! 변환 및 검증을 제공합니다.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// 거래소 심볼 인코딩에서 인식하는 기본 호가 자산 목록.
///
/// 긴 접미사가 먼저 매칭되도록 길이 내림차순으로 정렬되어 있습니다.
pub const DEFAULT_QUOTE_ASSETS: &[&str] = &["FDUSD", "USDT", "USDC", "BUSD", "TUSD", "BTC", "ETH", "BNB"];

/// 거래 가능한 상품을 나타내는 심볼.
///
/// 예: `BTC/USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    /// 기준 자산 (예: BTC)
    pub base: String,
    /// 호가 자산 (예: USDT)
    pub quote: String,
}

impl Symbol {
    /// 새 심볼을 생성합니다.
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().trim().to_uppercase(),
            quote: quote.into().trim().to_uppercase(),
        }
    }

    /// "BASE/QUOTE" 형식 문자열에서 심볼을 파싱합니다.
    pub fn from_string(s: &str) -> Option<Self> {
        let (base, quote) = s.split_once('/')?;
        let symbol = Self::new(base, quote);
        symbol.is_well_formed().then_some(symbol)
    }

    /// 거래소 형식(`BTCUSDT`)으로 변환합니다.
    pub fn to_exchange_format(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// 거래소 형식에서 심볼을 파싱합니다.
    ///
    /// 알려진 호가 자산 접미사가 없거나 기준 자산이 비어 있으면 `None`.
    pub fn from_exchange_format(raw: &str, known_quotes: &[&str]) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        if upper.is_empty() || !upper.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }

        known_quotes
            .iter()
            .filter(|quote| upper.len() > quote.len() && upper.ends_with(*quote))
            .max_by_key(|quote| quote.len())
            .map(|quote| Self::new(&upper[..upper.len() - quote.len()], *quote))
    }

    /// 표준 심볼 문자열 형식을 반환합니다.
    pub fn to_standard_string(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    fn is_well_formed(&self) -> bool {
        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
        valid(&self.base) && valid(&self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Symbol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s).ok_or_else(|| CoreError::InvalidSymbol(s.to_string()))
    }
}

impl TryFrom<String> for Symbol {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.to_standard_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_creation() {
        let symbol = Symbol::new("btc", "usdt");
        assert_eq!(symbol.base, "BTC");
        assert_eq!(symbol.quote, "USDT");
        assert_eq!(symbol.to_string(), "BTC/USDT");
    }

    #[test]
    fn test_symbol_from_string() {
        let symbol = Symbol::from_string("ETH/USDT").unwrap();
        assert_eq!(symbol.base, "ETH");
        assert_eq!(symbol.quote, "USDT");

        assert!(Symbol::from_string("ETHUSDT").is_none());
        assert!(Symbol::from_string("/USDT").is_none());
        assert!(Symbol::from_string("ETH/US-DT").is_none());
    }

    #[test]
    fn test_exchange_format_roundtrip() {
        let symbol = Symbol::new("SOL", "USDT");
        assert_eq!(symbol.to_exchange_format(), "SOLUSDT");

        let parsed = Symbol::from_exchange_format("solusdt", DEFAULT_QUOTE_ASSETS).unwrap();
        assert_eq!(parsed, symbol);
    }

    #[test]
    fn test_exchange_format_prefers_longest_quote() {
        let parsed = Symbol::from_exchange_format("BTCFDUSD", DEFAULT_QUOTE_ASSETS).unwrap();
        assert_eq!(parsed, Symbol::new("BTC", "FDUSD"));
    }

    #[test]
    fn test_exchange_format_rejects_unknown_encoding() {
        assert!(Symbol::from_exchange_format("BTCXYZ", DEFAULT_QUOTE_ASSETS).is_none());
        assert!(Symbol::from_exchange_format("USDT", DEFAULT_QUOTE_ASSETS).is_none());
        assert!(Symbol::from_exchange_format("BTC_USDT", DEFAULT_QUOTE_ASSETS).is_none());
        assert!(Symbol::from_exchange_format("", DEFAULT_QUOTE_ASSETS).is_none());
    }
}
