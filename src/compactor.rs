use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};

/// Compact the WAL if at least `threshold` records were appended since the
/// last compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        debug!(appended, threshold, "compaction not needed");
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL bounded.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
