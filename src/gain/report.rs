//! Row-level and summary CSV reports.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::gain::compute::GainRow;
use crate::gain::summary::GainSummary;
use crate::gain::table::format_record;
use crate::gain::GainError;

pub const ROWS_FILE_NAME: &str = "gain_rows.csv";
pub const SUMMARY_FILE_NAME: &str = "gain_summary.csv";

pub const ROW_COLUMNS: [&str; 17] = [
    "source_file",
    "device_id",
    "plate_type",
    "date_str",
    "tester",
    "phase",
    "time_ms",
    "sum_t_f",
    "coef_z",
    "l1z_raw",
    "l1z_scaled",
    "din",
    "f0",
    "f1",
    "dout",
    "gain",
    "flag",
];

pub const SUMMARY_COLUMNS: [&str; 11] = [
    "plate_type",
    "device_id",
    "phase",
    "coef_z",
    "temp_bucket_f",
    "n",
    "gain_mean",
    "gain_std",
    "gain_median",
    "gain_min",
    "gain_max",
];

/// Where the two reports were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub rows: PathBuf,
    pub summary: PathBuf,
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn row_record(row: &GainRow) -> Vec<String> {
    vec![
        row.source_file.clone(),
        row.device_id.clone(),
        row.plate_type.clone(),
        row.date.clone(),
        row.tester.clone(),
        row.phase.clone(),
        row.time_ms.to_string(),
        row.sum_t_f.to_string(),
        row.coef.to_string(),
        row.l1z_raw.to_string(),
        row.l1z_scaled.to_string(),
        opt(row.input_change_pct),
        opt(row.output_before),
        opt(row.output_after),
        opt(row.output_change_pct),
        opt(row.gain),
        row.flag.as_str().to_string(),
    ]
}

fn summary_record(s: &GainSummary) -> Vec<String> {
    vec![
        s.plate_type.clone(),
        s.device_id.clone(),
        s.phase.clone(),
        s.coef.to_string(),
        s.temp_bucket.clone(),
        s.n.to_string(),
        s.gain_mean.to_string(),
        s.gain_std.to_string(),
        s.gain_median.to_string(),
        s.gain_min.to_string(),
        s.gain_max.to_string(),
    ]
}

fn write_table<I>(path: &Path, header: &[&str], records: I) -> Result<(), GainError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let file = std::fs::File::create(path).map_err(|e| GainError::io(path, e))?;
    let mut out = std::io::BufWriter::new(file);
    writeln!(out, "{}", format_record(header)).map_err(|e| GainError::io(path, e))?;
    for record in records {
        writeln!(out, "{}", format_record(&record)).map_err(|e| GainError::io(path, e))?;
    }
    out.flush().map_err(|e| GainError::io(path, e))
}

/// Write both reports into `out_dir`, creating it if needed.
///
/// The summary file always carries its header, even with no valid rows.
pub fn write_reports(
    out_dir: &Path,
    rows: &[GainRow],
    summary: &[GainSummary],
) -> Result<ReportPaths, GainError> {
    std::fs::create_dir_all(out_dir).map_err(|e| GainError::io(out_dir, e))?;
    let paths = ReportPaths {
        rows: out_dir.join(ROWS_FILE_NAME),
        summary: out_dir.join(SUMMARY_FILE_NAME),
    };
    write_table(&paths.rows, &ROW_COLUMNS, rows.iter().map(row_record))?;
    write_table(&paths.summary, &SUMMARY_COLUMNS, summary.iter().map(summary_record))?;
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gain::compute::RowFlag;
    use crate::gain::table::CsvTable;

    #[test]
    fn test_reports_have_stable_columns() {
        let dir = std::env::temp_dir().join(format!("fluxlite-report-{}", uuid::Uuid::new_v4()));
        let row = GainRow {
            source_file: "07.1/d/t/discrete_temp_session.csv".to_string(),
            device_id: "07.1".to_string(),
            plate_type: "07".to_string(),
            date: "2025-01-01".to_string(),
            tester: "kim, j".to_string(),
            phase: "45lb".to_string(),
            time_ms: 10,
            sum_t_f: 70.5,
            coef: 0.002,
            l1z_raw: 10.0,
            l1z_scaled: 11.0,
            input_change_pct: Some(10.0),
            output_before: Some(20.0),
            output_after: None,
            output_change_pct: None,
            gain: None,
            flag: RowFlag::MissingOutput,
        };

        let paths = write_reports(&dir, &[row], &[]).unwrap();

        let rows = CsvTable::parse(&std::fs::read_to_string(&paths.rows).unwrap());
        assert_eq!(rows.headers, ROW_COLUMNS.to_vec());
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.rows[0][4], "kim, j");
        assert_eq!(rows.rows[0][12], "20");
        assert_eq!(rows.rows[0][13], "");
        assert_eq!(rows.rows[0][16], "missing_output");

        let summary = CsvTable::parse(&std::fs::read_to_string(&paths.summary).unwrap());
        assert_eq!(summary.headers, SUMMARY_COLUMNS.to_vec());
        assert!(summary.rows.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }
}
