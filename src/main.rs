use std::path::PathBuf;

use tracing::info;

use presence::compactor;
use presence::engine::{Engine, EngineConfig};
use presence::model::SubjectKind;

/// Maintenance pass over a presence data directory: replay the WAL, sweep
/// the interval pool, compact the log if it has grown and report what is left.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let data_dir = std::env::var("PRESENCE_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let min_significant_minutes: i64 = std::env::var("PRESENCE_MIN_SIGNIFICANT_MINUTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let compact_threshold: u64 = std::env::var("PRESENCE_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("presence.wal");

    let config = EngineConfig::with_min_significant_minutes(min_significant_minutes);
    let engine = Engine::new(wal_path.clone(), config)?;
    info!("presence maintenance on {}", wal_path.display());
    info!("  min_significant_minutes: {min_significant_minutes}");
    info!("  compact_threshold: {compact_threshold}");

    let report = engine.sweep().await?;
    info!(
        "swept {} intervals, {} presence records",
        report.evicted.len(),
        report.cascaded
    );

    let appends = engine.wal_appends_since_compact().await;
    if compactor::compact_if_needed(&engine, compact_threshold).await? {
        info!("compacted WAL ({appends} transactions since last compaction)");
    }

    info!("  intervals: {}", engine.interval_count().await);
    let subjects = engine.subjects().await;
    for kind in SubjectKind::ALL {
        let n = subjects.iter().filter(|s| s.kind == kind).count();
        info!("  {kind} timelines: {n}");
    }

    info!("presence maintenance done");
    Ok(())
}
