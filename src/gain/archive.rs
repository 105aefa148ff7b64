//! Archived discrete temperature sessions.
//!
//! Layout: `<root>/<device folder>/<date>/<tester>/discrete_temp_session.csv`.
//! The device folder looks like `07.00000051`; its prefix is the plate type.

use std::path::{Path, PathBuf};

use crate::core::scaling::SENSOR_LAYOUT;
use crate::gain::table::CsvTable;
use crate::gain::GainError;

/// File name of an archived session.
pub const ARCHIVE_FILE_NAME: &str = "discrete_temp_session.csv";

/// Path-derived metadata of an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveMeta {
    pub plate_type: String,
    pub date: String,
    pub tester: String,
}

impl ArchiveMeta {
    /// Read metadata from `archive`'s position under `root`. Missing levels
    /// are left empty.
    pub fn from_path(root: &Path, archive: &Path) -> Self {
        let relative = archive.strip_prefix(root).unwrap_or(archive);
        let parts: Vec<String> = relative
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let part = |i: usize| parts.get(i).cloned().unwrap_or_default();
        let device_folder = part(0);
        Self {
            plate_type: device_folder
                .split('.')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string(),
            date: part(1),
            tester: part(2),
        }
    }
}

/// One raw row of an archived session.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedRow {
    pub device_id: String,
    pub plate_type: String,
    pub date: String,
    pub tester: String,
    pub phase: String,
    pub time_ms: i64,
    /// Average plate temperature (°F)
    pub sum_t_f: f64,
    pub sum_z: f64,
    /// Per-sensor z force, in [`SENSOR_LAYOUT`] order
    pub z: [f64; 8],
    /// Per-sensor temperature (°F); falls back to `sum_t_f`
    pub t_f: [f64; 8],
}

/// A loaded archive file.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub path: PathBuf,
    pub meta: ArchiveMeta,
    pub rows: Vec<ArchivedRow>,
}

impl Archive {
    /// Device id of the session (first row's), or the plate type.
    pub fn device_id(&self) -> &str {
        self.rows
            .first()
            .map(|r| r.device_id.as_str())
            .unwrap_or(self.meta.plate_type.as_str())
    }
}

/// Canonical phase label: `45lb`, `bodyweight`, or the lowercased input.
pub fn normalize_phase(raw: &str) -> String {
    let s = raw.trim().to_lowercase();
    if s.starts_with("45") || s.contains("db") {
        "45lb".to_string()
    } else if s.contains("body") {
        "bodyweight".to_string()
    } else if s.is_empty() {
        "unknown".to_string()
    } else {
        s
    }
}

/// Every archive under `root`, in sorted path order.
pub fn discover_archives(root: &Path) -> Result<Vec<PathBuf>, GainError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| GainError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| GainError::io(&dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .map(|n| n.to_string_lossy().eq_ignore_ascii_case(ARCHIVE_FILE_NAME))
                .unwrap_or(false)
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn parse_f64(value: Option<&str>) -> Option<f64> {
    value.and_then(|v| v.parse::<f64>().ok()).filter(|v| v.is_finite())
}

/// Load one archive file.
pub fn load_archive(root: &Path, path: &Path) -> Result<Archive, GainError> {
    let text = std::fs::read_to_string(path).map_err(|e| GainError::io(path, e))?;
    let table = CsvTable::parse(&text);
    let meta = ArchiveMeta::from_path(root, path);
    if table.headers.is_empty() {
        return Ok(Archive {
            path: path.to_path_buf(),
            meta,
            rows: Vec::new(),
        });
    }

    let device_col = table.first_column(&["device_id", "deviceId"]);
    let phase_col = table.first_column(&["phase_name", "phase"]);
    let time_col = table.first_column(&["time", "time_ms"]);
    let temp_col = table.first_column(&["sum-t", "sum_t", "avgTemperatureF"]);
    let sum_z_col = table.first_column(&["sum-z", "sum_z"]);
    let z_cols: Vec<Option<usize>> = SENSOR_LAYOUT
        .iter()
        .map(|s| table.column(&format!("{s}-z")))
        .collect();
    let t_cols: Vec<Option<usize>> = SENSOR_LAYOUT
        .iter()
        .map(|s| table.column(&format!("{s}-t")))
        .collect();
    if z_cols.iter().all(Option::is_none) {
        return Err(GainError::Parse {
            path: path.to_path_buf(),
            message: "no per-sensor z columns".to_string(),
        });
    }

    let rows = table
        .rows
        .iter()
        .map(|row| {
            let device_id = table
                .cell(row, device_col)
                .map(str::to_string)
                .unwrap_or_else(|| meta.plate_type.clone());
            let plate_type = if meta.plate_type.is_empty() {
                device_id.split('.').next().unwrap_or_default().to_string()
            } else {
                meta.plate_type.clone()
            };
            let sum_t_f = parse_f64(table.cell(row, temp_col)).unwrap_or(0.0);

            let mut z = [0.0; 8];
            let mut t_f = [sum_t_f; 8];
            for i in 0..SENSOR_LAYOUT.len() {
                z[i] = parse_f64(table.cell(row, z_cols[i])).unwrap_or(0.0);
                if let Some(t) = parse_f64(table.cell(row, t_cols[i])) {
                    t_f[i] = t;
                }
            }

            ArchivedRow {
                device_id,
                plate_type,
                date: meta.date.clone(),
                tester: meta.tester.clone(),
                phase: normalize_phase(table.cell(row, phase_col).unwrap_or_default()),
                time_ms: parse_f64(table.cell(row, time_col)).map(|t| t as i64).unwrap_or(0),
                sum_t_f,
                sum_z: parse_f64(table.cell(row, sum_z_col)).unwrap_or(0.0),
                z,
                t_f,
            }
        })
        .collect();

    Ok(Archive {
        path: path.to_path_buf(),
        meta,
        rows,
    })
}
