use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::engine::Engine;
use crate::observability;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that periodically revokes expired priority grants and
/// monthly bypasses. Expired entries are already invisible to the booking
/// path; this just reclaims them and records the revocation.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = Utc::now();
        let grants = engine.collect_expired_grants(now).await;
        let bypasses = engine.collect_expired_bypasses(now).await;
        let swept = grants + bypasses;
        if swept > 0 {
            metrics::counter!(observability::EXPIRED_SWEPT_TOTAL).increment(swept as u64);
            info!(grants, bypasses, "reaped expired entitlements");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::warn!(error = %e, "WAL compaction failed"),
        }
    }
}
