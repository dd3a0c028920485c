//! Candle gap audit.
//!
//! Loads the stored candles for one `(exchange, symbol, tf)` key, newest
//! first, and reports every adjacent pair whose distance differs from the
//! timeframe width.

mod file_source;

pub use file_source::JsonFileCandleSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{timeframe_width, Candle};
use crate::error::{AdapterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
}

/// `[field, op, value]` filter clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterClause {
    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Evaluate against a serialized record
    pub fn matches(&self, record: &Value) -> bool {
        match self.op {
            FilterOp::Eq => record.get(&self.field) == Some(&self.value),
        }
    }
}

/// Inclusive range over a numeric key; open ends are unbounded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub key: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl RangeSpec {
    pub fn contains(&self, value: i64) -> bool {
        self.start.map_or(true, |start| value >= start) && self.end.map_or(true, |end| value <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub order_by: String,
    pub direction: SortDirection,
}

/// Persistence-backed candle query
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn get_in_range(
        &self,
        filters: &[FilterClause],
        range: &RangeSpec,
        order: &OrderSpec,
    ) -> Result<Vec<Candle>>;
}

/// Which candle series to audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleSelector {
    pub exchange: String,
    pub symbol: String,
    pub tf: String,
}

impl CandleSelector {
    pub fn new(exchange: &str, symbol: &str, tf: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            tf: tf.to_string(),
        }
    }

    fn filters(&self) -> Vec<FilterClause> {
        vec![
            FilterClause::equals("exchange", self.exchange.as_str()),
            FilterClause::equals("symbol", self.symbol.as_str()),
            FilterClause::equals("tf", self.tf.as_str()),
        ]
    }
}

/// Audit window in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

/// Span between two adjacent candles that should have had more samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MissingRange {
    /// Older candle bounding the gap
    pub after_mts: i64,
    /// Newer candle bounding the gap
    pub before_mts: i64,
    /// Whole timeframe widths missing in between
    pub missing_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapReport {
    /// `gaps[k] = i` means the gap lies between `candles[i]` and `candles[i + 1]`
    pub gaps: Vec<usize>,
    pub candles: Vec<Candle>,
}

impl GapReport {
    pub fn has_gaps(&self) -> bool {
        !self.gaps.is_empty()
    }

    pub fn missing_ranges(&self, width: i64) -> Vec<MissingRange> {
        self.gaps
            .iter()
            .filter_map(|&i| {
                let newer = self.candles.get(i)?;
                let older = self.candles.get(i + 1)?;
                let distance = newer.mts.saturating_sub(older.mts);
                let missing_count = if width > 0 {
                    (distance / width).saturating_sub(1).max(0)
                } else {
                    0
                };
                Some(MissingRange {
                    after_mts: older.mts,
                    before_mts: newer.mts,
                    missing_count,
                })
            })
            .collect()
    }
}

/// Indices `i` where `candles[i].mts - candles[i + 1].mts != width(tf)`.
///
/// Fewer than two candles never consult the width table. A distance that
/// does not fit in `i64` is a gap.
pub fn find_gaps(candles: &[Candle], tf: &str) -> Result<Vec<usize>> {
    if candles.len() < 2 {
        return Ok(Vec::new());
    }

    let width = timeframe_width(tf).ok_or_else(|| AdapterError::UnknownTimeframe(tf.to_string()))?;

    Ok(candles
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[0].mts.checked_sub(pair[1].mts) != Some(width))
        .map(|(i, _)| i)
        .collect())
}

/// Query the selected series, newest first, and report its gaps
pub async fn audit_candle_gaps(
    source: &dyn CandleSource,
    selector: &CandleSelector,
    range: TimeRange,
) -> Result<GapReport> {
    let range_spec = RangeSpec {
        key: "mts".to_string(),
        start: range.start,
        end: range.end,
    };
    let order = OrderSpec {
        order_by: "mts".to_string(),
        direction: SortDirection::Desc,
    };

    let candles = source
        .get_in_range(&selector.filters(), &range_spec, &order)
        .await?;
    debug!(
        "Loaded {} candles for {}:{}:{}",
        candles.len(),
        selector.exchange,
        selector.symbol,
        selector.tf
    );

    let gaps = find_gaps(&candles, &selector.tf)?;
    if !gaps.is_empty() {
        info!(
            "Found {} gaps in {}:{}:{}",
            gaps.len(),
            selector.exchange,
            selector.symbol,
            selector.tf
        );
    }

    Ok(GapReport { gaps, candles })
}
