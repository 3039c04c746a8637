//! Result-file reader/writer and atomic file replacement.
//!
//! A result file holds exactly one [`ResultRecord`] wrapped with a schema
//! version. Readers reject any other version instead of guessing.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::ResultRecord;
use crate::{Error, Result};

/// Schema version of per-job result files.
pub const RESULT_SCHEMA_VERSION: &str = "toystudy.result/1";

#[derive(Serialize)]
struct ResultFileRef<'a> {
    schema_version: &'a str,
    record: &'a ResultRecord,
}

#[derive(Deserialize)]
struct ResultFileHeader {
    schema_version: String,
}

#[derive(Deserialize)]
struct ResultFileOwned {
    record: ResultRecord,
}

/// Why a result file could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultFileError {
    /// No file at the path.
    Missing,
    /// The file declares another schema version.
    SchemaMismatch(String),
    /// Unreadable, truncated or otherwise malformed.
    Corrupt(String),
}

impl std::fmt::Display for ResultFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultFileError::Missing => write!(f, "result file missing"),
            ResultFileError::SchemaMismatch(v) => write!(f, "unexpected schema version {v:?}"),
            ResultFileError::Corrupt(m) => write!(f, "corrupt result file: {m}"),
        }
    }
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a partial write: temp file in the same directory, fsync,
/// rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("tmpfile");
    let tmp = parent.join(format!(".{}.tmp.{}", name, std::process::id()));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Write one result record.
pub fn write_result_file(path: &Path, record: &ResultRecord) -> Result<()> {
    write_json_atomic(path, &ResultFileRef { schema_version: RESULT_SCHEMA_VERSION, record })
}

/// Read and validate one result record.
pub fn read_result_file(path: &Path) -> std::result::Result<ResultRecord, ResultFileError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ResultFileError::Missing),
        Err(e) => return Err(ResultFileError::Corrupt(e.to_string())),
    };
    let header: ResultFileHeader =
        serde_json::from_slice(&bytes).map_err(|e| ResultFileError::Corrupt(e.to_string()))?;
    if header.schema_version != RESULT_SCHEMA_VERSION {
        return Err(ResultFileError::SchemaMismatch(header.schema_version));
    }
    let file: ResultFileOwned =
        serde_json::from_slice(&bytes).map_err(|e| ResultFileError::Corrupt(e.to_string()))?;
    if !file.record.wall_time_s.is_finite() {
        return Err(ResultFileError::Corrupt("non-finite wall time".to_string()));
    }
    Ok(file.record)
}

/// Read a JSON document, mapping a missing file to a validation error that
/// names the path.
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Validation(format!("file not found: {}", path.display()))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}
