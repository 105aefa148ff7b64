//! Per-row gain computation.

use std::collections::{HashMap, VecDeque};

use crate::core::scaling::{l1_norm, pct_change, scale_sensors};
use crate::gain::archive::{normalize_phase, ArchivedRow};
use crate::gain::backend::ProcessedSample;

/// Why a row does or does not contribute to the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowFlag {
    Valid,
    /// |inputChangePct| below epsilon (or undefined)
    DegenerateInput,
    /// No processed output for the baseline or the perturbed run
    MissingOutput,
}

impl RowFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            RowFlag::Valid => "valid",
            RowFlag::DegenerateInput => "degenerate_input",
            RowFlag::MissingOutput => "missing_output",
        }
    }
}

/// One archived row evaluated at one coefficient.
#[derive(Debug, Clone, PartialEq)]
pub struct GainRow {
    pub source_file: String,
    pub device_id: String,
    pub plate_type: String,
    pub date: String,
    pub tester: String,
    pub phase: String,
    pub time_ms: i64,
    pub sum_t_f: f64,
    pub coef: f64,
    pub l1z_raw: f64,
    pub l1z_scaled: f64,
    pub input_change_pct: Option<f64>,
    /// Processed sum-z without correction
    pub output_before: Option<f64>,
    /// Processed sum-z with `coef` applied
    pub output_after: Option<f64>,
    pub output_change_pct: Option<f64>,
    /// Only present when `flag` is [`RowFlag::Valid`]
    pub gain: Option<f64>,
    pub flag: RowFlag,
}

/// Match processed output to raw rows.
///
/// Lookup order per raw row: exact (time, phase) with the last duplicate
/// winning; then the remaining outputs at the same time in file order; then
/// the output at the same index.
pub fn align_outputs(rows: &[ArchivedRow], processed: &[ProcessedSample]) -> Vec<Option<f64>> {
    let mut by_key: HashMap<(i64, String), f64> = HashMap::new();
    let mut by_time: HashMap<i64, VecDeque<f64>> = HashMap::new();
    for sample in processed {
        by_key.insert((sample.time_ms, normalize_phase(&sample.phase)), sample.sum_z);
        by_time.entry(sample.time_ms).or_default().push_back(sample.sum_z);
    }

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            if let Some(v) = by_key.get(&(row.time_ms, row.phase.clone())) {
                return Some(*v);
            }
            if let Some(v) = by_time.get_mut(&row.time_ms).and_then(VecDeque::pop_front) {
                return Some(v);
            }
            processed.get(i).map(|s| s.sum_z)
        })
        .collect()
}

/// Evaluate every row of one archive at `coef`.
///
/// `before` and `after` are the aligned baseline and perturbed outputs;
/// missing entries yield [`RowFlag::MissingOutput`].
pub fn compute_rows(
    source_file: &str,
    rows: &[ArchivedRow],
    before: &[Option<f64>],
    after: &[Option<f64>],
    coef: f64,
    room_temp_f: f64,
    epsilon_pct: f64,
) -> Vec<GainRow> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let l1z_raw = l1_norm(&row.z);
            let l1z_scaled = l1_norm(&scale_sensors(&row.z, &row.t_f, coef, room_temp_f));
            let input_change_pct = pct_change(l1z_scaled, l1z_raw);

            let output_before = before.get(i).copied().flatten();
            let output_after = after.get(i).copied().flatten();
            let output_change_pct = match (output_before, output_after) {
                (Some(f0), Some(f1)) => pct_change(f1, f0),
                _ => None,
            };

            let (flag, gain) = classify(input_change_pct, output_change_pct, epsilon_pct);

            GainRow {
                source_file: source_file.to_string(),
                device_id: row.device_id.clone(),
                plate_type: row.plate_type.clone(),
                date: row.date.clone(),
                tester: row.tester.clone(),
                phase: row.phase.clone(),
                time_ms: row.time_ms,
                sum_t_f: row.sum_t_f,
                coef,
                l1z_raw,
                l1z_scaled,
                input_change_pct,
                output_before,
                output_after,
                output_change_pct,
                gain,
                flag,
            }
        })
        .collect()
}

fn classify(din: Option<f64>, dout: Option<f64>, epsilon_pct: f64) -> (RowFlag, Option<f64>) {
    let din = match din {
        Some(d) if d.abs() >= epsilon_pct => d,
        _ => return (RowFlag::DegenerateInput, None),
    };
    match dout {
        Some(dout) => (RowFlag::Valid, Some(dout / din)),
        None => (RowFlag::MissingOutput, None),
    }
}
