use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use super::{CandleSource, FilterClause, OrderSpec, RangeSpec, SortDirection};
use crate::domain::Candle;
use crate::error::{AdapterError, Result};

/// Candle store backed by a JSON array file, used by the `audit` command
#[derive(Debug, Clone, Default)]
pub struct JsonFileCandleSource {
    candles: Vec<Candle>,
}

impl JsonFileCandleSource {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let candles: Vec<Candle> = serde_json::from_str(&raw).map_err(|e| {
            AdapterError::SampleSource(format!("{}: {}", path.display(), e))
        })?;
        debug!("Loaded {} candles from {}", candles.len(), path.display());
        Ok(Self { candles })
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

fn sort_key(candle: &Candle, record: &Value, key: &str) -> Result<i64> {
    if key == "mts" {
        return Ok(candle.mts);
    }
    record
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| AdapterError::SampleSource(format!("non-numeric key: {}", key)))
}

#[async_trait]
impl CandleSource for JsonFileCandleSource {
    async fn get_in_range(
        &self,
        filters: &[FilterClause],
        range: &RangeSpec,
        order: &OrderSpec,
    ) -> Result<Vec<Candle>> {
        let mut selected = Vec::new();

        for candle in &self.candles {
            let record = serde_json::to_value(candle)?;
            if !filters.iter().all(|clause| clause.matches(&record)) {
                continue;
            }
            if !range.contains(sort_key(candle, &record, &range.key)?) {
                continue;
            }
            let ordering = sort_key(candle, &record, &order.order_by)?;
            selected.push((ordering, candle.clone()));
        }

        selected.sort_by_key(|(ordering, _)| *ordering);
        if order.direction == SortDirection::Desc {
            selected.reverse();
        }

        Ok(selected.into_iter().map(|(_, candle)| candle).collect())
    }
}
