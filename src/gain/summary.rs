//! Grouped gain statistics.

use std::collections::BTreeMap;

use statrs::statistics::{Data, Median, Statistics};

use crate::gain::compute::{GainRow, RowFlag};

/// Width of a temperature bucket (°F).
pub const TEMP_BUCKET_F: f64 = 2.0;

/// Statistics of one (plate, device, phase, coef, temperature bucket) group.
#[derive(Debug, Clone, PartialEq)]
pub struct GainSummary {
    pub plate_type: String,
    pub device_id: String,
    pub phase: String,
    pub coef: f64,
    pub temp_bucket: String,
    pub n: usize,
    pub gain_mean: f64,
    /// Population standard deviation; 0 for a single row
    pub gain_std: f64,
    pub gain_median: f64,
    pub gain_min: f64,
    pub gain_max: f64,
}

/// `"<lo>-<hi>"` label of the `width`-wide bucket holding `t_f`.
pub fn temp_bucket(t_f: f64, width: f64) -> String {
    if width.is_nan() || width <= 0.0 || !t_f.is_finite() {
        return "na".to_string();
    }
    let lo = (t_f / width).floor() * width;
    format!("{:.0}-{:.0}", lo, lo + width)
}

// Coefficients are grouped in micro-units so that float keys order and
// compare exactly.
type GroupKey = (String, String, String, i64, String);

/// Aggregate valid rows. Groups come out in key order.
pub fn summarize(rows: &[GainRow]) -> Vec<GainSummary> {
    let mut groups: BTreeMap<GroupKey, (f64, Vec<f64>)> = BTreeMap::new();
    for row in rows {
        let gain = match (row.flag, row.gain) {
            (RowFlag::Valid, Some(g)) if g.is_finite() => g,
            _ => continue,
        };
        let key = (
            row.plate_type.clone(),
            row.device_id.clone(),
            row.phase.clone(),
            (row.coef * 1e6).round() as i64,
            temp_bucket(row.sum_t_f, TEMP_BUCKET_F),
        );
        groups.entry(key).or_insert_with(|| (row.coef, Vec::new())).1.push(gain);
    }

    groups
        .into_iter()
        .map(|((plate_type, device_id, phase, _, temp_bucket), (coef, values))| {
            let n = values.len();
            let gain_mean = Statistics::mean(values.iter());
            let gain_std = if n >= 2 {
                Statistics::population_std_dev(values.iter())
            } else {
                0.0
            };
            let gain_min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let gain_max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let gain_median = Data::new(values).median();
            GainSummary {
                plate_type,
                device_id,
                phase,
                coef,
                temp_bucket,
                n,
                gain_mean,
                gain_std,
                gain_median,
                gain_min,
                gain_max,
            }
        })
        .collect()
}

/// Row totals per flag, for auditing exclusions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagTotals {
    pub valid: u64,
    pub degenerate_input: u64,
    pub missing_output: u64,
}

impl FlagTotals {
    pub fn from_rows(rows: &[GainRow]) -> Self {
        let mut totals = Self::default();
        for row in rows {
            match row.flag {
                RowFlag::Valid => totals.valid += 1,
                RowFlag::DegenerateInput => totals.degenerate_input += 1,
                RowFlag::MissingOutput => totals.missing_output += 1,
            }
        }
        totals
    }

    pub fn total(&self) -> u64 {
        self.valid + self.degenerate_input + self.missing_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(phase: &str, coef: f64, t: f64, gain: Option<f64>, flag: RowFlag) -> GainRow {
        GainRow {
            source_file: "a.csv".to_string(),
            device_id: "07.1".to_string(),
            plate_type: "07".to_string(),
            date: String::new(),
            tester: String::new(),
            phase: phase.to_string(),
            time_ms: 0,
            sum_t_f: t,
            coef,
            l1z_raw: 1.0,
            l1z_scaled: 1.0,
            input_change_pct: None,
            output_before: None,
            output_after: None,
            output_change_pct: None,
            gain,
            flag,
        }
    }

    #[test]
    fn test_temp_bucket_labels() {
        assert_eq!(temp_bucket(71.3, 2.0), "70-72");
        assert_eq!(temp_bucket(72.0, 2.0), "72-74");
        assert_eq!(temp_bucket(-0.5, 2.0), "-2-0");
        assert_eq!(temp_bucket(70.0, 0.0), "na");
    }

    #[test]
    fn test_summary_groups_and_statistics() {
        let rows = vec![
            row("45lb", 0.002, 70.1, Some(1.0), RowFlag::Valid),
            row("45lb", 0.002, 71.9, Some(3.0), RowFlag::Valid),
            row("45lb", 0.002, 70.5, Some(2.0), RowFlag::Valid),
            row("45lb", 0.002, 70.5, None, RowFlag::DegenerateInput),
            row("45lb", 0.001, 70.5, Some(5.0), RowFlag::Valid),
            row("bodyweight", 0.002, 74.0, Some(4.0), RowFlag::Valid),
        ];
        let summary = summarize(&rows);
        assert_eq!(summary.len(), 3);

        // sorted by coef within the phase
        assert_eq!(summary[0].coef, 0.001);
        assert_eq!(summary[0].n, 1);
        assert_eq!(summary[0].gain_std, 0.0);

        let main = &summary[1];
        assert_eq!(main.coef, 0.002);
        assert_eq!(main.temp_bucket, "70-72");
        assert_eq!(main.n, 3);
        assert!((main.gain_mean - 2.0).abs() < 1e-12);
        assert!((main.gain_std - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(main.gain_median, 2.0);
        assert_eq!(main.gain_min, 1.0);
        assert_eq!(main.gain_max, 3.0);

        assert_eq!(summary[2].phase, "bodyweight");
        assert_eq!(summary[2].temp_bucket, "74-76");

        let totals = FlagTotals::from_rows(&rows);
        assert_eq!(totals.valid, 5);
        assert_eq!(totals.degenerate_input, 1);
        assert_eq!(totals.total(), 6);
    }
}
