use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const ONE_MINUTE_MS: i64 = 60 * 1000;
const ONE_HOUR_MS: i64 = 60 * ONE_MINUTE_MS;
const ONE_DAY_MS: i64 = 24 * ONE_HOUR_MS;

/// Candle timeframe supported by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
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
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1D")]
    OneDay,
    #[serde(rename = "7D")]
    SevenDays,
    #[serde(rename = "14D")]
    FourteenDays,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Timeframe {
    /// All timeframes, shortest first
    pub const ALL: [Timeframe; 12] = [
        Timeframe::OneMinute,
        Timeframe::FiveMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::ThirtyMinutes,
        Timeframe::OneHour,
        Timeframe::ThreeHours,
        Timeframe::SixHours,
        Timeframe::TwelveHours,
        Timeframe::OneDay,
        Timeframe::SevenDays,
        Timeframe::FourteenDays,
        Timeframe::OneMonth,
    ];

    /// Wire code, e.g. `1h`
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::ThreeHours => "3h",
            Timeframe::SixHours => "6h",
            Timeframe::TwelveHours => "12h",
            Timeframe::OneDay => "1D",
            Timeframe::SevenDays => "7D",
            Timeframe::FourteenDays => "14D",
            Timeframe::OneMonth => "1M",
        }
    }

    /// Human readable label, e.g. `1 Hour`
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1 Minute",
            Timeframe::FiveMinutes => "5 Minutes",
            Timeframe::FifteenMinutes => "15 Minutes",
            Timeframe::ThirtyMinutes => "30 Minutes",
            Timeframe::OneHour => "1 Hour",
            Timeframe::ThreeHours => "3 Hours",
            Timeframe::SixHours => "6 Hours",
            Timeframe::TwelveHours => "12 Hours",
            Timeframe::OneDay => "1 Day",
            Timeframe::SevenDays => "7 Days",
            Timeframe::FourteenDays => "14 Days",
            Timeframe::OneMonth => "1 Month",
        }
    }

    /// Expected distance between two consecutive candles in milliseconds
    pub fn width_ms(&self) -> i64 {
        match self {
            Timeframe::OneMinute => ONE_MINUTE_MS,
            Timeframe::FiveMinutes => 5 * ONE_MINUTE_MS,
            Timeframe::FifteenMinutes => 15 * ONE_MINUTE_MS,
            Timeframe::ThirtyMinutes => 30 * ONE_MINUTE_MS,
            Timeframe::OneHour => ONE_HOUR_MS,
            Timeframe::ThreeHours => 3 * ONE_HOUR_MS,
            Timeframe::SixHours => 6 * ONE_HOUR_MS,
            Timeframe::TwelveHours => 12 * ONE_HOUR_MS,
            Timeframe::OneDay => ONE_DAY_MS,
            Timeframe::SevenDays => 7 * ONE_DAY_MS,
            Timeframe::FourteenDays => 14 * ONE_DAY_MS,
            Timeframe::OneMonth => 30 * ONE_DAY_MS,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    // Codes are case sensitive: `1m` is a minute, `1M` a month.
    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == raw.trim())
            .ok_or_else(|| format!("unknown timeframe: {}", raw))
    }
}

/// Look up the width of a timeframe code; `None` for unregistered codes.
pub fn timeframe_width(code: &str) -> Option<i64> {
    Timeframe::from_str(code).ok().map(|tf| tf.width_ms())
}

/// One periodic OHLCV sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    /// Timeframe code. Kept as a string so stored samples with unknown codes still load.
    pub tf: String,
    /// Sample timestamp in milliseconds
    pub mts: i64,
    #[serde(default)]
    pub open: Decimal,
    #[serde(default)]
    pub close: Decimal,
    #[serde(default)]
    pub high: Decimal,
    #[serde(default)]
    pub low: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

impl Candle {
    /// Bare sample without price data
    pub fn at(exchange: &str, symbol: &str, tf: &str, mts: i64) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            mts,
            open: Decimal::ZERO,
            close: Decimal::ZERO,
            high: Decimal::ZERO,
            low: Decimal::ZERO,
            volume: Decimal::ZERO,
        }
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        Timeframe::from_str(&self.tf).ok()
    }
}
