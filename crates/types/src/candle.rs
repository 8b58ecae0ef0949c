//! Candle data model, wire decoding and validation
//!
//! Incoming broker payloads are JSON candle records. Decoding and
//! validation are a data path, not an error path: a payload that cannot
//! be turned into a well-formed [`Candle`] becomes a
//! [`DecodeOutcome::Poison`] carrying the reason and the offset it
//! occupied, so the pipeline can count it and still advance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Record;

/// Candle aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Interval {
    /// Stable string form, used as the database column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated OHLCV candle, keyed by `(symbol, interval, open_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: i64,
    /// When this process first saw the candle
    pub ingest_time: DateTime<Utc>,
}

/// Why a candle failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol is empty")]
    EmptySymbol,
    #[error("symbol is longer than 20 characters")]
    SymbolTooLong,
    #[error("{field} is negative")]
    Negative { field: &'static str },
    #[error("trade_count is negative")]
    NegativeTradeCount,
    #[error("low exceeds high")]
    InvertedRange,
    #[error("{field} falls outside [low, high]")]
    OutOfRange { field: &'static str },
}

/// Upper bound on symbol length accepted from the wire.
pub const MAX_SYMBOL_LEN: usize = 20;

impl Candle {
    /// Check the key fields and OHLC relations.
    ///
    /// `open` and `close` must both lie within `[low, high]`, all numeric
    /// fields must be non-negative, and the symbol must be non-empty and
    /// bounded in length.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        if self.symbol.len() > MAX_SYMBOL_LEN {
            return Err(ValidationError::SymbolTooLong);
        }
        for (field, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ] {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(ValidationError::Negative { field });
            }
        }
        if self.trade_count < 0 {
            return Err(ValidationError::NegativeTradeCount);
        }
        if self.low > self.high {
            return Err(ValidationError::InvertedRange);
        }
        if self.open < self.low || self.open > self.high {
            return Err(ValidationError::OutOfRange { field: "open" });
        }
        if self.close < self.low || self.close > self.high {
            return Err(ValidationError::OutOfRange { field: "close" });
        }
        Ok(())
    }
}

/// Wire shape of a candle payload.
#[derive(Debug, Deserialize)]
struct RawCandle {
    symbol: String,
    interval: Interval,
    open_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    trade_count: i64,
}

/// Reason a record was excluded from the pipeline, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonReason {
    /// Payload was not valid JSON or did not match the candle shape
    JsonDecode,
    /// Payload decoded but a numeric field was not representable
    NumericParse,
    /// Candle decoded but failed semantic validation
    Validation,
}

impl PoisonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoisonReason::JsonDecode => "json_decode_error",
            PoisonReason::NumericParse => "numeric_parse_error",
            PoisonReason::Validation => "validation_error",
        }
    }
}

/// Result of decoding a broker record.
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    Valid(Candle),
    Poison {
        reason: PoisonReason,
        partition: i32,
        offset: i64,
    },
}

fn to_decimal(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64_retain(value)
}

/// Decode a broker record into a candle.
///
/// Symbols are normalized to uppercase. NaN and infinite prices are
/// rejected as poison rather than errors.
pub fn decode_record(record: &Record) -> DecodeOutcome {
    let poison = |reason| DecodeOutcome::Poison {
        reason,
        partition: record.partition,
        offset: record.offset,
    };

    let raw: RawCandle = match serde_json::from_slice(&record.payload) {
        Ok(raw) => raw,
        Err(_) => return poison(PoisonReason::JsonDecode),
    };

    let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
        to_decimal(raw.open),
        to_decimal(raw.high),
        to_decimal(raw.low),
        to_decimal(raw.close),
        to_decimal(raw.volume),
    ) else {
        return poison(PoisonReason::NumericParse);
    };

    DecodeOutcome::Valid(Candle {
        symbol: raw.symbol.to_uppercase(),
        interval: raw.interval,
        open_time: raw.open_time,
        open,
        high,
        low,
        close,
        volume,
        trade_count: raw.trade_count,
        ingest_time: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record_with(payload: &str) -> Record {
        Record::new(0, 42, payload.as_bytes().to_vec())
    }

    fn valid_payload() -> String {
        r#"{
            "symbol": "btc-usd",
            "interval": "1m",
            "open_time": "2024-05-01T12:00:00Z",
            "open": 100.0,
            "high": 110.0,
            "low": 95.0,
            "close": 105.0,
            "volume": 12.5,
            "trade_count": 37
        }"#
        .to_string()
    }

    fn valid_candle() -> Candle {
        match decode_record(&record_with(&valid_payload())) {
            DecodeOutcome::Valid(candle) => candle,
            DecodeOutcome::Poison { reason, .. } => {
                panic!("expected valid candle, got poison: {:?}", reason)
            }
        }
    }

    #[test]
    fn test_decode_valid_payload() {
        let candle = valid_candle();
        assert_eq!(candle.symbol, "BTC-USD");
        assert_eq!(candle.interval, Interval::OneMinute);
        assert_eq!(candle.open, dec!(100));
        assert_eq!(candle.trade_count, 37);
        assert!(candle.validate().is_ok());
    }

    #[test]
    fn test_decode_invalid_json_is_poison() {
        let outcome = decode_record(&record_with("not json"));
        match outcome {
            DecodeOutcome::Poison {
                reason,
                partition,
                offset,
            } => {
                assert_eq!(reason, PoisonReason::JsonDecode);
                assert_eq!(partition, 0);
                assert_eq!(offset, 42);
            }
            DecodeOutcome::Valid(_) => panic!("expected poison"),
        }
    }

    #[test]
    fn test_decode_missing_field_is_poison() {
        let outcome = decode_record(&record_with(r#"{"symbol": "BTC-USD"}"#));
        assert!(matches!(
            outcome,
            DecodeOutcome::Poison {
                reason: PoisonReason::JsonDecode,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_unknown_interval_is_poison() {
        let payload = valid_payload().replace("\"1m\"", "\"7m\"");
        let outcome = decode_record(&record_with(&payload));
        assert!(matches!(outcome, DecodeOutcome::Poison { .. }));
    }

    #[test]
    fn test_validate_high_below_low() {
        let mut candle = valid_candle();
        candle.low = dec!(120);
        candle.high = dec!(90);
        assert!(matches!(
            candle.validate(),
            Err(ValidationError::InvertedRange) | Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_open_outside_range() {
        let mut candle = valid_candle();
        candle.open = dec!(200);
        assert_eq!(
            candle.validate(),
            Err(ValidationError::OutOfRange { field: "open" })
        );
    }

    #[test]
    fn test_validate_close_outside_range() {
        let mut candle = valid_candle();
        candle.close = dec!(1);
        assert_eq!(
            candle.validate(),
            Err(ValidationError::OutOfRange { field: "close" })
        );
    }

    #[test]
    fn test_validate_negative_volume() {
        let mut candle = valid_candle();
        candle.volume = dec!(-1);
        assert_eq!(
            candle.validate(),
            Err(ValidationError::Negative { field: "volume" })
        );
    }

    #[test]
    fn test_validate_empty_symbol() {
        let mut candle = valid_candle();
        candle.symbol = String::new();
        assert_eq!(candle.validate(), Err(ValidationError::EmptySymbol));
    }

    #[test]
    fn test_validate_symbol_too_long() {
        let mut candle = valid_candle();
        candle.symbol = "X".repeat(MAX_SYMBOL_LEN + 1);
        assert_eq!(candle.validate(), Err(ValidationError::SymbolTooLong));
    }

    #[test]
    fn test_interval_roundtrip() {
        for interval in [
            Interval::OneMinute,
            Interval::FiveMinutes,
            Interval::OneHour,
            Interval::OneDay,
        ] {
            let json = serde_json::to_string(&interval).unwrap();
            let parsed: Interval = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, interval);
        }
        assert_eq!(Interval::FourHours.as_str(), "4h");
    }

    #[test]
    fn test_poison_reason_labels() {
        assert_eq!(PoisonReason::JsonDecode.as_str(), "json_decode_error");
        assert_eq!(PoisonReason::Validation.as_str(), "validation_error");
    }
}
