//! Sources of backend-processed `sum-z` output.
//!
//! The backend's model is opaque here: a provider only has to return the
//! processed samples for an archive, either uncorrected (`coef = None`) or
//! with a temperature coefficient applied.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::gain::archive::normalize_phase;
use crate::gain::table::{format_record, CsvTable};
use crate::gain::GainError;

/// One processed output sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedSample {
    pub time_ms: i64,
    pub phase: String,
    pub sum_z: f64,
}

/// Supplies processed output for an archive.
pub trait OutputProvider: Send + Sync {
    fn processed(
        &self,
        archive: &Path,
        device_id: &str,
        coef: Option<f64>,
    ) -> Result<Vec<ProcessedSample>, GainError>;
}

/// `off` for the baseline, `c<coef:.6>` otherwise.
pub fn coef_key(coef: Option<f64>) -> String {
    match coef {
        None => "off".to_string(),
        Some(c) => format!("c{c:.6}"),
    }
}

/// Processed-file name for `archive` at `coef`, e.g.
/// `discrete_temp_session__c0.002000.csv`.
pub fn processed_file_name(archive: &Path, coef: Option<f64>) -> String {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    format!("{}__{}.csv", stem, coef_key(coef))
}

/// Parse a processed CSV into samples, in file order.
pub fn parse_processed(text: &str) -> Vec<ProcessedSample> {
    let table = CsvTable::parse(text);
    let time_col = table.first_column(&["time", "time_ms"]);
    let phase_col = table.first_column(&["phase_name", "phase"]);
    let sum_z_col = table.first_column(&["sum-z", "sum_z"]);
    table
        .rows
        .iter()
        .map(|row| ProcessedSample {
            time_ms: table
                .cell(row, time_col)
                .and_then(|v| v.parse::<f64>().ok())
                .map(|t| t as i64)
                .unwrap_or(0),
            phase: normalize_phase(table.cell(row, phase_col).unwrap_or_default()),
            sum_z: table
                .cell(row, sum_z_col)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
        })
        .collect()
}

/// Pre-processed outputs stored on disk.
///
/// The file for an archive at `<data root>/<rel>/<name>.csv` is looked up as
/// `<output root>/<rel>/<name>__<coef key>.csv`.
#[derive(Debug, Clone)]
pub struct ArchivedOutputs {
    data_root: PathBuf,
    output_root: PathBuf,
}

impl ArchivedOutputs {
    pub fn new(data_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            output_root: output_root.into(),
        }
    }

    /// Outputs kept next to the archives themselves.
    pub fn alongside(data_root: impl Into<PathBuf>) -> Self {
        let root = data_root.into();
        Self::new(root.clone(), root)
    }

    pub fn path_for(&self, archive: &Path, coef: Option<f64>) -> PathBuf {
        let relative_dir = archive
            .strip_prefix(&self.data_root)
            .ok()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.output_root
            .join(relative_dir)
            .join(processed_file_name(archive, coef))
    }
}

impl OutputProvider for ArchivedOutputs {
    fn processed(
        &self,
        archive: &Path,
        _device_id: &str,
        coef: Option<f64>,
    ) -> Result<Vec<ProcessedSample>, GainError> {
        let path = self.path_for(archive, coef);
        if !is_populated(&path) {
            return Err(GainError::Backend(format!(
                "no processed output at {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(&path).map_err(|e| GainError::io(&path, e))?;
        Ok(parse_processed(&text))
    }
}

/// True when `path` is a file with content. Empty files left behind by an
/// interrupted request count as missing.
pub fn is_populated(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Size and modification time of a file, the parts of its identity that
/// change when it is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStamp {
    pub modified_ns: u128,
    pub size: u64,
}

impl FileStamp {
    pub fn of(path: &Path) -> Result<Self, GainError> {
        let meta = std::fs::metadata(path).map_err(|e| GainError::io(path, e))?;
        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Self {
            modified_ns,
            size: meta.len(),
        })
    }
}

/// Everything that decides what the backend returns for one request.
#[derive(Serialize)]
struct RequestFingerprint<'a> {
    input: String,
    stamp: FileStamp,
    coef: String,
    room: String,
    revision: &'a str,
}

/// Bumped when sanitizing changes what is sent to the backend.
const SANITIZE_REVISION: &str = "sanitized_v2";

/// Length of the hex digest kept in cache file names.
const KEY_LEN: usize = 12;

fn short_hash<T: Serialize>(value: &T) -> Result<String, GainError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| GainError::Backend(format!("cache key: {e}")))?;
    let mut hex = blake3::hash(&bytes).to_hex().to_string();
    hex.truncate(KEY_LEN);
    Ok(hex)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string())
}

/// Trim padded header cells and device ids so the backend sees clean
/// column names.
pub fn sanitize_csv(text: &str) -> String {
    let mut table = CsvTable::parse(text);
    if let Some(col) = table.first_column(&["device_id", "deviceId"]) {
        for row in &mut table.rows {
            if let Some(cell) = row.get_mut(col) {
                *cell = cell.trim().to_string();
            }
        }
    }
    let mut out = format_record(&table.headers);
    out.push('\n');
    for row in &table.rows {
        out.push_str(&format_record(row));
        out.push('\n');
    }
    out
}

/// On-disk cache for backend requests.
///
/// Sanitized copies of the archives live under `<cache>/_inputs/`; processed
/// outputs mirror the archive layout under `<cache>/` and are named
/// `<stem>__<coef key>__<hash>.csv`. The hash covers the sanitized input's
/// path, size and modification time together with the coefficient and the
/// room temperature, so a rewritten archive or a different room temperature
/// never reuses a stale result.
#[derive(Debug, Clone)]
pub struct BackendCache {
    data_root: PathBuf,
    root: PathBuf,
}

impl BackendCache {
    pub fn new(data_root: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            root: root.into(),
        }
    }

    fn input_path(&self, archive: &Path) -> Result<PathBuf, GainError> {
        let absolute = std::fs::canonicalize(archive).map_err(|e| GainError::io(archive, e))?;
        let key = short_hash(&(
            absolute.to_string_lossy(),
            FileStamp::of(archive)?,
            SANITIZE_REVISION,
        ))?;
        Ok(self
            .root
            .join("_inputs")
            .join(format!("{}__{}.csv", file_stem(archive), key)))
    }

    /// Sanitized copy of `archive`, written once per archive revision.
    pub fn sanitized_input(&self, archive: &Path) -> Result<PathBuf, GainError> {
        let path = self.input_path(archive)?;
        if is_populated(&path) {
            return Ok(path);
        }
        let text = std::fs::read_to_string(archive).map_err(|e| GainError::io(archive, e))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| GainError::io(dir, e))?;
        }
        std::fs::write(&path, sanitize_csv(&text)).map_err(|e| GainError::io(&path, e))?;
        Ok(path)
    }

    /// Cache location for the output of `input` (a sanitized copy of
    /// `archive`) at `coef` and `room_temp_f`.
    pub fn output_path(
        &self,
        archive: &Path,
        input: &Path,
        coef: Option<f64>,
        room_temp_f: f64,
    ) -> Result<PathBuf, GainError> {
        let fingerprint = RequestFingerprint {
            input: input.to_string_lossy().to_string(),
            stamp: FileStamp::of(input)?,
            coef: coef_key(coef),
            room: format!("rt{room_temp_f:.1}"),
            revision: SANITIZE_REVISION,
        };
        let relative_dir = archive
            .strip_prefix(&self.data_root)
            .ok()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(self.root.join(relative_dir).join(format!(
            "{}__{}__{}.csv",
            file_stem(archive),
            coef_key(coef),
            short_hash(&fingerprint)?
        )))
    }
}

#[cfg(feature = "http-backend")]
pub use http::HttpBackend;

#[cfg(feature = "http-backend")]
mod http {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tracing::{debug, info};

    #[derive(Debug, Deserialize)]
    struct ProcessResponse {
        #[serde(default, alias = "path", alias = "processed_csv")]
        #[serde(rename = "outputPath")]
        output_path: Option<String>,
    }

    /// Runs archives through the backend's `process-csv` endpoint and keeps
    /// the results in a [`BackendCache`].
    pub struct HttpBackend {
        client: reqwest::Client,
        runtime: tokio::runtime::Runtime,
        url: String,
        room_temp_f: f64,
        cache: BackendCache,
    }

    impl HttpBackend {
        pub fn new(
            host: &str,
            port: u16,
            room_temp_f: f64,
            data_root: impl Into<PathBuf>,
            cache_dir: impl Into<PathBuf>,
            timeout: std::time::Duration,
        ) -> Result<Self, GainError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| GainError::Backend(format!("Failed to create HTTP client: {e}")))?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(|e| GainError::Backend(format!("Failed to create runtime: {e}")))?;

            let host = host.trim().trim_end_matches('/');
            let base = if host.starts_with("http") {
                host.to_string()
            } else {
                format!("http://{host}")
            };

            Ok(Self {
                client,
                runtime,
                url: format!("{base}:{port}/api/device/process-csv"),
                room_temp_f,
                cache: BackendCache::new(data_root, cache_dir),
            })
        }

        pub fn url(&self) -> &str {
            &self.url
        }

        async fn request(
            &self,
            input: &Path,
            device_id: &str,
            coef: Option<f64>,
            output_dir: &Path,
        ) -> Result<PathBuf, GainError> {
            let mut body = json!({
                "csvPath": input.to_string_lossy(),
                "deviceId": device_id.trim(),
                "outputDir": output_dir.to_string_lossy(),
                "use_temperature_correction": coef.is_some(),
                "room_temperature_f": self.room_temp_f,
                "mode": "scalar",
            });
            if let Some(c) = coef {
                body["temperature_correction_coefficients"] = json!({"x": 0.0, "y": 0.0, "z": c});
            }

            let response = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| GainError::Backend(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(GainError::Backend(format!(
                    "process-csv failed ({}): {}",
                    status.as_u16(),
                    message
                )));
            }

            let parsed: ProcessResponse = response
                .json()
                .await
                .map_err(|e| GainError::Backend(e.to_string()))?;
            parsed
                .output_path
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .ok_or_else(|| GainError::Backend(format!("no output path for {}", input.display())))
        }
    }

    impl OutputProvider for HttpBackend {
        fn processed(
            &self,
            archive: &Path,
            device_id: &str,
            coef: Option<f64>,
        ) -> Result<Vec<ProcessedSample>, GainError> {
            let input = self.cache.sanitized_input(archive)?;
            let cached = self.cache.output_path(archive, &input, coef, self.room_temp_f)?;
            if is_populated(&cached) {
                debug!("Cache hit {}", cached.display());
            } else {
                let dir = cached.parent().map(Path::to_path_buf).unwrap_or_default();
                std::fs::create_dir_all(&dir).map_err(|e| GainError::io(&dir, e))?;

                debug!("Requesting {} for {}", coef_key(coef), archive.display());
                let produced = self
                    .runtime
                    .block_on(self.request(&input, device_id, coef, &dir))?;
                if produced != cached {
                    if std::fs::rename(&produced, &cached).is_err() {
                        std::fs::copy(&produced, &cached)
                            .map_err(|e| GainError::io(&produced, e))?;
                        let _ = std::fs::remove_file(&produced);
                    }
                }
                if !is_populated(&cached) {
                    return Err(GainError::Backend(format!(
                        "empty processed output for {}",
                        archive.display()
                    )));
                }
                info!("Cached processed output {}", cached.display());
            }
            let text = std::fs::read_to_string(&cached).map_err(|e| GainError::io(&cached, e))?;
            Ok(parse_processed(&text))
        }
    }
}
