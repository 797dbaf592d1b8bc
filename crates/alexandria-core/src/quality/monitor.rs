//! Quality Degradation Monitor
//!
//! Watches the quality history over a lookback window (default 30 days) and
//! flags any resource whose overall score dropped by more than 20% between
//! its earliest and latest computation in the window.

use std::sync::Arc;

use chrono::Duration;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kernel::Kernel;
use crate::storage::format_ts;

/// Lookback window in days.
pub const DEGRADATION_WINDOW_DAYS: i64 = 30;
/// Relative drop that counts as degradation.
pub const DEGRADATION_DROP: f64 = 0.20;

/// A degraded resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationReport {
    /// Resource id
    pub resource_id: String,
    /// Earliest overall in the window
    pub previous_overall: f64,
    /// Latest overall in the window
    pub current_overall: f64,
    /// Relative drop in [0, 1]
    pub drop_fraction: f64,
}

/// The degradation monitor.
pub struct QualityMonitor {
    kernel: Arc<Kernel>,
}

impl QualityMonitor {
    /// Create the monitor over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Scan the history window and report resources whose overall quality
    /// fell by more than the threshold.
    pub fn degraded_resources(&self, window_days: Option<i64>) -> Result<Vec<DegradationReport>> {
        let window = window_days.unwrap_or(DEGRADATION_WINDOW_DAYS);
        let cutoff = self.kernel.now() - Duration::days(window);

        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_id, overall, computed_at FROM quality_history
                 WHERE computed_at >= ?1
                 ORDER BY resource_id ASC, computed_at ASC",
            )?;
            let rows = stmt.query_map(params![format_ts(cutoff)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;

            let mut reports = Vec::new();
            let mut current: Option<(String, f64, f64)> = None; // (id, first, last)
            for row in rows {
                let (resource_id, overall) = row?;
                match &mut current {
                    Some((id, _, last)) if *id == resource_id => {
                        *last = overall;
                    }
                    _ => {
                        if let Some(report) = finish(current.take()) {
                            reports.push(report);
                        }
                        current = Some((resource_id, overall, overall));
                    }
                }
            }
            if let Some(report) = finish(current.take()) {
                reports.push(report);
            }
            Ok(reports)
        })
    }
}

fn finish(entry: Option<(String, f64, f64)>) -> Option<DegradationReport> {
    let (resource_id, first, last) = entry?;
    if first <= f64::EPSILON {
        return None;
    }
    let drop_fraction = (first - last) / first;
    if drop_fraction > DEGRADATION_DROP {
        Some(DegradationReport {
            resource_id,
            previous_overall: first,
            current_overall: last,
            drop_fraction,
        })
    } else {
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_flags_large_drop() {
        let report = finish(Some(("r1".to_string(), 0.8, 0.5))).unwrap();
        assert!((report.drop_fraction - 0.375).abs() < 1e-9);
    }

    #[test]
    fn test_finish_ignores_small_drop_and_gains() {
        assert!(finish(Some(("r1".to_string(), 0.8, 0.7))).is_none());
        assert!(finish(Some(("r1".to_string(), 0.5, 0.9))).is_none());
        assert!(finish(None).is_none());
    }
}
