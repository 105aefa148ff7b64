//! Process-wide data-quality counters.
//!
//! Counters make every dropped, flagged or excluded item auditable. They are
//! lock-free so the ingestion loop and the gain workers can bump them
//! without coordination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const METRIC_COUNT: usize = 11;

/// A counted condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    FramesIngested,
    UnresolvedFrames,
    RecordGaps,
    GroupRefreshRequests,
    StaleCaptureEvents,
    RejectedConfigValues,
    BackendErrors,
    GainRowsValid,
    GainRowsDegenerate,
    GainRowsMissingOutput,
    ObserverEventsDropped,
}

impl Metric {
    pub const ALL: [Metric; METRIC_COUNT] = [
        Metric::FramesIngested,
        Metric::UnresolvedFrames,
        Metric::RecordGaps,
        Metric::GroupRefreshRequests,
        Metric::StaleCaptureEvents,
        Metric::RejectedConfigValues,
        Metric::BackendErrors,
        Metric::GainRowsValid,
        Metric::GainRowsDegenerate,
        Metric::GainRowsMissingOutput,
        Metric::ObserverEventsDropped,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::FramesIngested => "Frames ingested",
            Metric::UnresolvedFrames => "Frames with unresolved identity",
            Metric::RecordGaps => "Record-id gaps",
            Metric::GroupRefreshRequests => "Group refresh requests",
            Metric::StaleCaptureEvents => "Stale capture events ignored",
            Metric::RejectedConfigValues => "Config values rejected",
            Metric::BackendErrors => "Backend errors",
            Metric::GainRowsValid => "Gain rows valid",
            Metric::GainRowsDegenerate => "Gain rows degenerate",
            Metric::GainRowsMissingOutput => "Gain rows missing output",
            Metric::ObserverEventsDropped => "Observer events dropped",
        }
    }
}

/// Counter set for one process run.
#[derive(Debug)]
pub struct Stats {
    counters: [AtomicU64; METRIC_COUNT],
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Counters that are saved to and restored from `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);
        if let Err(e) = stats.load() {
            debug!("Could not load previous stats: {}", e);
        }
        stats
    }

    pub fn record(&self, metric: Metric) {
        self.add(metric, 1);
    }

    pub fn add(&self, metric: Metric, count: u64) {
        self.counters[metric.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counters[metric.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: Metric::ALL
                .iter()
                .map(|m| (m.label().to_string(), self.get(*m)))
                .collect(),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary, one counter per line.
    pub fn summary(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::from("Session Statistics:\n");
        for (label, value) in &snapshot.counters {
            out.push_str(&format!("- {}: {}\n", label, value));
        }
        out.push_str(&format!(
            "- Session duration: {} seconds",
            snapshot.session_duration_secs
        ));
        out
    }

    /// Write counters to the persistence path, if any.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedStats {
            counters: self.snapshot().counters,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&persisted)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedStats =
            serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        for metric in Metric::ALL {
            if let Some((_, value)) = persisted.counters.iter().find(|(l, _)| l == metric.label()) {
                self.counters[metric.index()].store(*value, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// (label, value) in [`Metric::ALL`] order
    pub counters: Vec<(String, u64)>,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    counters: Vec<(String, u64)>,
    last_updated: DateTime<Utc>,
}

pub type SharedStats = Arc<Stats>;

pub fn create_shared_stats() -> SharedStats {
    Arc::new(Stats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(Stats::with_persistence(path))
}
