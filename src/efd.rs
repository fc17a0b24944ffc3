//! Historical telemetry queries used to backfill state after a restart.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

pub const ESS_TEMPERATURE_TOPIC: &str = "lsst.sal.ESS.temperature";
pub const ESS_DEW_POINT_TOPIC: &str = "lsst.sal.ESS.dewPoint";

/// Columnar query result; every column has one value per timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    pub timestamps: Vec<f64>,
    pub columns: HashMap<String, Vec<f64>>,
}

impl TimeSeries {
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column(&self, field: &str) -> &[f64] {
        self.columns.get(field).map_or(&[], Vec::as_slice)
    }
}

#[async_trait]
pub trait HistoricalClient: Send + Sync {
    /// Samples of `fields` from `topic` with `start <= timestamp <= end`
    /// (TAI seconds), restricted to the given SAL index.
    async fn select_time_series(
        &self,
        topic: &str,
        fields: &[&str],
        start: f64,
        end: f64,
        index: u32,
    ) -> Result<TimeSeries>;
}

/// A client with nothing recorded. Every query is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHistory;

#[async_trait]
impl HistoricalClient for NoHistory {
    async fn select_time_series(&self, _: &str, _: &[&str], _: f64, _: f64, _: u32) -> Result<TimeSeries> {
        Ok(TimeSeries::default())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordedHistory;
    use super::*;

    #[tokio::test]
    async fn recorded_history_filters_by_range_and_index() -> anyhow::Result<()> {
        let mut history = RecordedHistory::default();
        history.record(ESS_TEMPERATURE_TOPIC, 301, "temperatureItem0", 10.0, 1.0);
        history.record(ESS_TEMPERATURE_TOPIC, 301, "temperatureItem0", 20.0, 2.0);
        history.record(ESS_TEMPERATURE_TOPIC, 112, "temperatureItem0", 15.0, 9.0);

        let series = history
            .select_time_series(ESS_TEMPERATURE_TOPIC, &["temperatureItem0"], 5.0, 15.0, 301)
            .await?;
        assert_eq!(series.timestamps, vec![10.0]);
        assert_eq!(series.column("temperatureItem0"), &[1.0]);
        assert!(series.column("missing").is_empty());

        assert!(NoHistory
            .select_time_series(ESS_TEMPERATURE_TOPIC, &["temperatureItem0"], 0.0, 1e9, 301)
            .await?
            .is_empty());
        Ok(())
    }
}
