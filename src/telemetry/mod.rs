//! Data-quality telemetry.

pub mod stats;

pub use stats::{
    create_shared_stats, create_shared_stats_with_persistence, Metric, SharedStats, Stats,
    StatsSnapshot,
};
