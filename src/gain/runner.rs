//! Sweep runner: fans archives out to worker threads, merges their rows in
//! file order, aggregates and writes the reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};

use crate::gain::archive::{discover_archives, load_archive, ArchivedRow};
use crate::gain::backend::{coef_key, OutputProvider};
use crate::gain::compute::{align_outputs, compute_rows, GainRow};
use crate::gain::report::{write_reports, ReportPaths};
use crate::gain::summary::{summarize, FlagTotals, GainSummary};
use crate::gain::GainError;
use crate::telemetry::{Metric, SharedStats};

/// Largest number of coefficients a range sweep may expand to.
pub const MAX_SWEEP_VALUES: usize = 10_000;

/// Coefficient values to sweep, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefSweep(Vec<f64>);

impl CoefSweep {
    /// Parse `start:stop:step` (stop inclusive, values rounded to 6
    /// decimals) or a comma-separated list.
    pub fn parse(text: &str) -> Result<Self, GainError> {
        let text = text.trim();
        let invalid = |msg: &str| GainError::InvalidSweep(format!("{msg}: {text:?}"));

        let values = if text.contains(':') {
            let parts: Vec<f64> = text
                .split(':')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<f64>().map_err(|_| invalid("bad number")))
                .collect::<Result<_, _>>()?;
            let [start, stop, step] = parts[..] else {
                return Err(invalid("expected start:stop:step"));
            };
            if !(step.is_finite() && step > 0.0) {
                return Err(invalid("step must be positive"));
            }
            if !(start.is_finite() && stop.is_finite()) {
                return Err(invalid("non-finite bound"));
            }
            if stop < start {
                return Err(invalid("no coefficients"));
            }
            let steps = ((stop - start) / step + 1e-9).floor();
            if !steps.is_finite() || steps >= MAX_SWEEP_VALUES as f64 {
                return Err(invalid(&format!("more than {MAX_SWEEP_VALUES} coefficients")));
            }
            (0..=steps as usize)
                .map(|i| start + i as f64 * step)
                .map(|v| (v * 1e6).round() / 1e6)
                .collect()
        } else {
            text.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<f64>().map_err(|_| invalid("bad number")))
                .collect::<Result<Vec<_>, _>>()?
        };

        if values.is_empty() {
            return Err(invalid("no coefficients"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(invalid("non-finite coefficient"));
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parameters of one analysis run.
#[derive(Debug, Clone)]
pub struct GainRunConfig {
    pub data_root: PathBuf,
    pub out_dir: PathBuf,
    pub room_temp_f: f64,
    /// Minimum |inputChangePct| (percent) for a row to count
    pub epsilon_pct: f64,
    pub sweep: CoefSweep,
    /// 0 picks the available parallelism
    pub workers: usize,
    /// Process only the first N archives in path order; `Some(0)` is no limit
    pub limit_files: Option<usize>,
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct GainRun {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub rows: Vec<GainRow>,
    pub summary: Vec<GainSummary>,
    pub totals: FlagTotals,
    pub reports: ReportPaths,
}

/// Drives a sweep over every archive under the data root.
pub struct GainRunner {
    config: GainRunConfig,
    provider: Arc<dyn OutputProvider>,
    stats: SharedStats,
}

impl GainRunner {
    pub fn new(config: GainRunConfig, provider: Arc<dyn OutputProvider>, stats: SharedStats) -> Self {
        Self {
            config,
            provider,
            stats,
        }
    }

    pub fn config(&self) -> &GainRunConfig {
        &self.config
    }

    fn worker_count(&self, files: usize) -> usize {
        let wanted = if self.config.workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            self.config.workers
        };
        wanted.clamp(1, files.max(1))
    }

    /// Run the sweep and write both reports.
    pub fn run(&self) -> Result<GainRun, GainError> {
        let mut files = discover_archives(&self.config.data_root)?;
        // a limit of 0 means no limit
        if let Some(limit) = self.config.limit_files.filter(|&n| n > 0) {
            files.truncate(limit);
        }
        if files.is_empty() {
            return Err(GainError::NoFiles(self.config.data_root.clone()));
        }

        let workers = self.worker_count(files.len());
        info!(
            "Gain sweep: {} files, {} coefficients, {} workers",
            files.len(),
            self.config.sweep.len(),
            workers
        );

        let (job_tx, job_rx) = unbounded::<(usize, PathBuf)>();
        let (result_tx, result_rx) = unbounded::<(usize, Result<Vec<GainRow>, GainError>)>();
        for job in files.iter().cloned().enumerate() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for idx in 0..workers {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("gain-{idx}"))
                    .spawn_scoped(scope, move || {
                        for (i, path) in jobs.iter() {
                            let _ = results.send((i, self.process_file(&path)));
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn gain worker {}: {}", idx, e);
                }
            }
        });
        drop(result_tx);

        let mut per_file: Vec<(usize, Result<Vec<GainRow>, GainError>)> = result_rx.iter().collect();
        per_file.sort_by_key(|(i, _)| *i);

        let mut rows = Vec::new();
        let mut files_processed = 0;
        for (i, result) in per_file {
            match result {
                Ok(file_rows) => {
                    files_processed += 1;
                    rows.extend(file_rows);
                }
                Err(e) => warn!("Skipping {}: {}", files[i].display(), e),
            }
        }
        let files_skipped = files.len() - files_processed;

        let totals = FlagTotals::from_rows(&rows);
        self.stats.add(Metric::GainRowsValid, totals.valid);
        self.stats.add(Metric::GainRowsDegenerate, totals.degenerate_input);
        self.stats.add(Metric::GainRowsMissingOutput, totals.missing_output);
        info!(
            "Gain rows: {} valid, {} degenerate input, {} missing output",
            totals.valid, totals.degenerate_input, totals.missing_output
        );

        let summary = summarize(&rows);
        let reports = write_reports(&self.config.out_dir, &rows, &summary)?;
        info!(
            "Wrote {} and {}",
            reports.rows.display(),
            reports.summary.display()
        );

        Ok(GainRun {
            files_processed,
            files_skipped,
            rows,
            summary,
            totals,
            reports,
        })
    }

    fn process_file(&self, path: &Path) -> Result<Vec<GainRow>, GainError> {
        let archive = load_archive(&self.config.data_root, path)?;
        if archive.rows.is_empty() {
            debug!("{} has no rows", path.display());
            return Ok(Vec::new());
        }
        let device_id = archive.device_id().to_string();
        let source_file = path
            .strip_prefix(&self.config.data_root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        let before = self.aligned(&archive.rows, path, &device_id, None);
        let mut rows = Vec::with_capacity(archive.rows.len() * self.config.sweep.len());
        for &coef in self.config.sweep.values() {
            let after = self.aligned(&archive.rows, path, &device_id, Some(coef));
            rows.extend(compute_rows(
                &source_file,
                &archive.rows,
                &before,
                &after,
                coef,
                self.config.room_temp_f,
                self.config.epsilon_pct,
            ));
        }
        debug!("{}: {} rows", source_file, rows.len());
        Ok(rows)
    }

    /// Aligned outputs for `coef`, or all-missing when the provider fails.
    fn aligned(
        &self,
        rows: &[ArchivedRow],
        path: &Path,
        device_id: &str,
        coef: Option<f64>,
    ) -> Vec<Option<f64>> {
        match self.provider.processed(path, device_id, coef) {
            Ok(samples) => align_outputs(rows, &samples),
            Err(e) => {
                self.stats.record(Metric::BackendErrors);
                warn!("No {} output for {}: {}", coef_key(coef), path.display(), e);
                vec![None; rows.len()]
            }
        }
    }
}
