//! Concurrent fan-out over fee data sources

use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Provider of a single fee figure in wei
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    async fn get_data(&self) -> RelayerResult<u64>;
}

/// Set of sources aggregated by median
#[derive(Clone, Default)]
pub struct DataSources {
    sources: Vec<Arc<dyn Source>>,
}

impl DataSources {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Query every source concurrently and return the median of the
    /// successful answers.
    ///
    /// Failed sources are skipped. A source still running when this future
    /// is dropped finishes on its own and its result is discarded.
    pub async fn get_data(&self) -> RelayerResult<u64> {
        let (tx, mut rx) = mpsc::channel(self.sources.len().max(1));

        for source in &self.sources {
            let source = source.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match source.get_data().await {
                    Ok(value) => {
                        let _ = tx.send(value).await;
                    }
                    Err(e) => debug!("Gas source {} failed: {}", source.name(), e),
                }
            });
        }
        drop(tx);

        let mut values = Vec::with_capacity(self.sources.len());
        while let Some(value) = rx.recv().await {
            values.push(value);
        }

        median(values)
    }
}

/// Median of `values`; the mean of the two middle values (rounded down)
/// when the count is even.
pub fn median(mut values: Vec<u64>) -> RelayerResult<u64> {
    if values.is_empty() {
        return Err(RelayerError::NoGasData);
    }

    values.sort_unstable();
    let mid = values.len() / 2;

    if values.len() % 2 == 1 {
        return Ok(values[mid]);
    }

    let sum = u128::from(values[mid - 1]) + u128::from(values[mid]);
    u64::try_from(sum / 2).map_err(|e| RelayerError::Overflow(e.to_string()))
}
