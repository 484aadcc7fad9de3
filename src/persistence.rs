//! Persistence layer for saving/loading evaluation records.
//!
//! Supports both JSON (human-readable) and bincode (compact binary) formats.

use crate::error::{InsightEvalError, Result};
use crate::eval::EvaluationResult;
use crate::generation::InsightText;
use crate::invoice::ParsedInvoice;
use crate::pipeline::{PipelineState, PipelineStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Everything an evaluated run produced, frozen for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub run_id: Uuid,
    pub source: String,
    pub invoice: ParsedInvoice,
    pub insight: InsightText,
    pub evaluation: EvaluationResult,
    pub recorded_at: DateTime<Utc>,
}

impl EvaluationRecord {
    /// Snapshot an `evaluated` run. Any other status yields `None`.
    pub fn from_state(state: &PipelineState) -> Option<Self> {
        if state.status() != PipelineStatus::Evaluated {
            return None;
        }

        Some(Self {
            run_id: state.run_id(),
            source: state.source().to_string(),
            invoice: state.invoice()?.clone(),
            insight: state.insight()?.clone(),
            evaluation: state.evaluation()?.clone(),
            recorded_at: state.finished_at().unwrap_or_else(Utc::now),
        })
    }

    /// File name used when saving into a directory: `<stem>_<run id prefix>.<ext>`.
    pub fn file_name(&self, format: SaveFormat) -> String {
        let stem = Path::new(&self.source)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("invoice");
        let run = self.run_id.simple().to_string();

        format!("{}_{}.{}", stem, &run[..8], format.extension())
    }
}

/// Save format for evaluation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// JSON format (human-readable, larger).
    Json,
    /// Bincode format (binary, compact).
    Bincode,
}

impl SaveFormat {
    /// Determine format from file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => SaveFormat::Json,
            Some("bin") | Some("bincode") => SaveFormat::Bincode,
            _ => SaveFormat::Json,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Json => "json",
            SaveFormat::Bincode => "bin",
        }
    }
}

/// Save a record, picking the format from the file extension.
pub fn save_record(record: &EvaluationRecord, path: &Path) -> Result<()> {
    let format = SaveFormat::from_path(path);
    save_record_with_format(record, path, format)
}

/// Save a record with a specific format.
pub fn save_record_with_format(
    record: &EvaluationRecord,
    path: &Path,
    format: SaveFormat,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| InsightEvalError::io(parent, e))?;
        }
    }

    let data = match format {
        SaveFormat::Json => serde_json::to_string_pretty(record)
            .map_err(|e| InsightEvalError::Serialization(e.to_string()))?
            .into_bytes(),
        SaveFormat::Bincode => {
            let config = bincode::config::standard();
            bincode::serde::encode_to_vec(record, config)
                .map_err(|e| InsightEvalError::Serialization(e.to_string()))?
        }
    };

    fs::write(path, &data).map_err(|e| InsightEvalError::io(path, e))?;

    Ok(())
}

/// Save a record into `dir` under its generated file name.
pub fn save_to_dir(record: &EvaluationRecord, dir: &Path, format: SaveFormat) -> Result<PathBuf> {
    let path = dir.join(record.file_name(format));
    save_record_with_format(record, &path, format)?;
    Ok(path)
}

/// [`save_to_dir`] on the blocking pool, for use inside async tasks.
pub async fn save_to_dir_async(
    record: EvaluationRecord,
    dir: PathBuf,
    format: SaveFormat,
) -> Result<PathBuf> {
    let target = dir.clone();
    tokio::task::spawn_blocking(move || save_to_dir(&record, &dir, format))
        .await
        .map_err(|e| InsightEvalError::io(&target, std::io::Error::other(e)))?
}

/// Load a record from a file.
pub fn load_record(path: &Path) -> Result<EvaluationRecord> {
    if !path.exists() {
        return Err(InsightEvalError::RecordNotFound(path.to_path_buf()));
    }

    let format = SaveFormat::from_path(path);
    load_record_with_format(path, format)
}

/// Load a record with a specific format.
pub fn load_record_with_format(path: &Path, format: SaveFormat) -> Result<EvaluationRecord> {
    let data = fs::read(path).map_err(|e| InsightEvalError::io(path, e))?;

    let record = match format {
        SaveFormat::Json => serde_json::from_slice(&data)
            .map_err(|e| InsightEvalError::Serialization(e.to_string()))?,
        SaveFormat::Bincode => {
            let config = bincode::config::standard();
            let (record, _): (EvaluationRecord, usize) =
                bincode::serde::decode_from_slice(&data, config)
                    .map_err(|e| InsightEvalError::Serialization(e.to_string()))?;
            record
        }
    };

    Ok(record)
}

/// Check if a record file exists at the given path.
pub fn record_exists(path: &Path) -> bool {
    path.exists() && path.is_file()
}

/// Get the size of a record file in bytes.
pub fn record_size(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path).map_err(|e| InsightEvalError::io(path, e))?;
    Ok(metadata.len())
}
