//! Weighted training examples read from a JSONL queue file
//!
//! Each line is `{"query": "...", "response": "...", "weight": 3.0}`.
//! Lines that are not JSON objects or lack a string `query`/`response` are
//! skipped with a warning naming the line; the run only fails when nothing
//! valid is left.

use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Sampling weight for records that carry none.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// A single query/response pair with its sampling weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub query: String,
    pub response: String,
    pub weight: f64,
}

impl TrainingRecord {
    pub fn with_weight(query: impl Into<String>, response: impl Into<String>, weight: f64) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            weight: sanitize_weight(Some(weight)),
        }
    }

    /// A correction of a critical mistake.
    pub fn critical(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self::with_weight(query, response, WeightTier::High.weight())
    }

    /// A better answer than the one originally given.
    pub fn improvement(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self::with_weight(query, response, WeightTier::Medium.weight())
    }

    pub fn normal(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self::with_weight(query, response, WeightTier::Normal.weight())
    }

    pub fn tier(&self) -> WeightTier {
        WeightTier::from_weight(self.weight)
    }
}

/// Weight buckets: high is `>= 10`, medium is `[3, 10)`, normal is `< 3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightTier {
    High,
    Medium,
    Normal,
}

impl WeightTier {
    pub fn from_weight(weight: f64) -> Self {
        if weight >= 10.0 {
            WeightTier::High
        } else if weight >= 3.0 {
            WeightTier::Medium
        } else {
            WeightTier::Normal
        }
    }

    /// Weight assigned to new examples of this tier.
    pub fn weight(self) -> f64 {
        match self {
            WeightTier::High => 10.0,
            WeightTier::Medium => 3.0,
            WeightTier::Normal => 1.0,
        }
    }
}

/// A queue line that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineWarning {
    /// 1-based line number
    pub line: usize,
    pub reason: String,
}

impl fmt::Display for LineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {} {}, skipping", self.line, self.reason)
    }
}

/// Min/max/mean weight and tier counts of the loaded records.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub high: usize,
    pub medium: usize,
    pub normal: usize,
}

impl WeightSummary {
    pub fn from_records(records: &[TrainingRecord]) -> Self {
        let mut summary = WeightSummary {
            count: records.len(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            high: 0,
            medium: 0,
            normal: 0,
        };
        if records.is_empty() {
            summary.min = 0.0;
            summary.max = 0.0;
            return summary;
        }

        let mut total = 0.0;
        for record in records {
            summary.min = summary.min.min(record.weight);
            summary.max = summary.max.max(record.weight);
            total += record.weight;
            match record.tier() {
                WeightTier::High => summary.high += 1,
                WeightTier::Medium => summary.medium += 1,
                WeightTier::Normal => summary.normal += 1,
            }
        }
        summary.mean = total / records.len() as f64;
        summary
    }
}

impl fmt::Display for WeightSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Weight distribution:")?;
        writeln!(f, "  Min: {:.1}", self.min)?;
        writeln!(f, "  Max: {:.1}", self.max)?;
        writeln!(f, "  Mean: {:.1}", self.mean)?;
        writeln!(f, "  High-weight (≥10): {}", self.high)?;
        writeln!(f, "  Medium-weight (3-9): {}", self.medium)?;
        write!(f, "  Normal-weight (1-2): {}", self.normal)
    }
}

/// Everything the loader found in a queue file.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub path: PathBuf,
    pub records: Vec<TrainingRecord>,
    pub warnings: Vec<LineWarning>,
    /// Records whose weight was missing or invalid and defaulted to 1.0
    pub defaulted_weights: usize,
    pub summary: WeightSummary,
}

impl LoadReport {
    /// The valid records, or [`TrainError::NoValidRecords`] if there are none.
    pub fn into_records(self) -> Result<Vec<TrainingRecord>> {
        if self.records.is_empty() {
            return Err(TrainError::NoValidRecords {
                path: self.path,
                skipped: self.warnings.len(),
            });
        }
        Ok(self.records)
    }
}

/// Read and validate every line of a JSONL training queue.
pub fn load_training_records(path: &Path) -> Result<LoadReport> {
    if !path.is_file() {
        return Err(TrainError::QueueNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;

    let mut records = Vec::new();
    let mut warnings = Vec::new();
    let mut defaulted_weights = 0;

    for (index, line) in content.lines().enumerate() {
        let line_num = index + 1;
        match parse_record(line) {
            Ok((record, defaulted)) => {
                if defaulted {
                    defaulted_weights += 1;
                }
                records.push(record);
            }
            Err(reason) => {
                let warning = LineWarning { line: line_num, reason };
                warn!("{}", warning);
                warnings.push(warning);
            }
        }
    }

    if defaulted_weights > 0 {
        debug!("{} records use the default weight", defaulted_weights);
    }
    info!(
        "Loaded {} training examples from {} ({} skipped)",
        records.len(),
        path.display(),
        warnings.len()
    );

    let summary = WeightSummary::from_records(&records);
    Ok(LoadReport {
        path: path.to_path_buf(),
        records,
        warnings,
        defaulted_weights,
        summary,
    })
}

/// Parse one line; the flag reports whether the weight was defaulted.
fn parse_record(line: &str) -> std::result::Result<(TrainingRecord, bool), String> {
    if line.trim().is_empty() {
        return Err("is blank".to_string());
    }
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
    let object = value
        .as_object()
        .ok_or_else(|| "is not a JSON object".to_string())?;

    let field = |name: &str| -> std::result::Result<String, String> {
        match object.get(name) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(format!("has non-string {}", name)),
            None => Err("missing query/response".to_string()),
        }
    };
    let query = field("query")?;
    let response = field("response")?;

    let raw_weight = object.get("weight").and_then(|w| w.as_f64());
    let weight = sanitize_weight(raw_weight);
    let defaulted = raw_weight != Some(weight);

    Ok((
        TrainingRecord {
            query,
            response,
            weight,
        },
        defaulted,
    ))
}

/// Sampling weights must be finite and positive; anything else becomes 1.0.
fn sanitize_weight(weight: Option<f64>) -> f64 {
    match weight {
        Some(w) if w.is_finite() && w > 0.0 => w,
        _ => DEFAULT_WEIGHT,
    }
}

/// Move a consumed queue aside as `training_queue_archive_<YYYYmmdd_HHMMSS>.jsonl`.
pub fn archive_queue(path: &Path) -> Result<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");

    let mut archive = dir.join(format!("training_queue_archive_{}.jsonl", stamp));
    let mut suffix = 1;
    while archive.exists() {
        archive = dir.join(format!("training_queue_archive_{}_{}.jsonl", stamp, suffix));
        suffix += 1;
    }

    std::fs::rename(path, &archive)?;
    info!("Archived training queue to {}", archive.display());
    Ok(archive)
}
