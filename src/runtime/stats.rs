//! Run reports
//!
//! - [`MemoryMode`]: strategy a graph was assigned
//! - [`RunReport`]: what one `run` did, serializable for monitoring

use std::fmt;

use serde::Serialize;

use crate::graph::GraphId;
use crate::memory::PoolStats;

/// Memory strategy of an assigned graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// Fixed offsets assigned once, nothing freed between runs
    Static,
    /// Lazy allocation and reference-counted reuse from the pool
    Dynamic,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMode::Static => write!(f, "static"),
            MemoryMode::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Outcome of one graph run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub graph_id: GraphId,
    pub mode: MemoryMode,

    /// Kernels launched, equal to the execution order length on success
    pub kernels_launched: usize,

    /// Wall-clock time from first allocation to the end of the stream barrier
    pub elapsed_us: u64,

    /// Pool usage right after the run
    pub pool: PoolStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_report_serializable() {
        let report = RunReport {
            graph_id: GraphId(4),
            mode: MemoryMode::Dynamic,
            kernels_launched: 3,
            elapsed_us: 120,
            pool: PoolStats {
                capacity: 4096,
                in_use: 512,
                ..PoolStats::default()
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["graph_id"], 4);
        assert_eq!(json["mode"], "dynamic");
        assert_eq!(json["kernels_launched"], 3);
        assert_eq!(json["pool"]["in_use"], 512);
    }

    #[test]
    fn test_memory_mode_display() {
        assert_eq!(MemoryMode::Static.to_string(), "static");
        assert_eq!(MemoryMode::Dynamic.to_string(), "dynamic");
    }
}
