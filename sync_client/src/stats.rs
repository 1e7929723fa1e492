//! Counters for recoverable conditions. Nothing here is fatal; these exist so
//! degraded synchronization is visible in logs.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub spawns_enqueued: u64,
    pub spawns_materialized: u64,
    /// Spawn requests for an id that was already live or queued.
    pub duplicate_spawns: u64,
    /// Spawns dropped because their template was not loaded.
    pub missing_assets: u64,
    /// Locally simulated spawns whose lifetime ran out before materialization.
    pub expired_on_arrival: u64,

    pub updates_applied: u64,
    pub updates_buffered: u64,
    pub buffered_applied: u64,
    pub buffered_expired: u64,
    /// Buffered updates rejected because the buffer stayed full.
    pub buffered_dropped: u64,

    pub hard_snaps: u64,
    pub malformed_fields: u64,
    pub malformed_entries: u64,

    pub local_expiries: u64,
    pub stale_removals: u64,
    pub watchdog_cleanups: u64,
    pub removals: u64,

    pub fade_ops_executed: u64,
    pub fades_completed: u64,
    pub pool_reuses: u64,
    pub pool_evictions: u64,
}
