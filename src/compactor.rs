use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};

/// Compact the WAL if at least `threshold` transactions were appended since
/// the last compaction. Returns whether it compacted.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    debug!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that compacts the WAL every `period` once it has grown
/// past `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
