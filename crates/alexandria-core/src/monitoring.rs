//! Monitoring Snapshot
//!
//! One struct aggregating the counters the monitoring surface exposes: bus
//! delivery metrics, queue depths, cache hit rates, corpus and index sizes.

use serde::Serialize;

use crate::kernel::bus::BusMetrics;
use crate::kernel::cache::CacheStats;
use crate::kernel::queue::QueueStats;

/// Point-in-time system status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSnapshot {
    /// Event bus counters and latency percentiles
    pub events: BusMetrics,
    /// Task queue depths
    pub tasks: QueueStats,
    /// Cache counters
    pub cache: CacheStats,
    /// Rows in the resource table
    pub resources_total: u64,
    /// Resources with `ingestion_status = completed`
    pub resources_completed: u64,
    /// Documents in the lexical index
    pub lexical_documents: u64,
    /// Vectors in the dense index
    pub dense_vectors: u64,
    /// Documents in the sparse index
    pub sparse_documents: u64,
}
