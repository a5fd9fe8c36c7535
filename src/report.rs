use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// End-of-run summary. Printed as JSON on stdout and optionally persisted.
#[derive(Debug, Serialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub duration_seconds: f64,
    pub users: usize,
    pub iterations: u64,
    pub aborted_users: u64,
    pub steps: Vec<StepSummary>,
    pub poll: PollSummary,
}

#[derive(Debug, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub failure_rate: f64,
    pub min_ms: u64,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub requests_per_second: f64,
    pub status_codes: BTreeMap<u16, u64>,
}

/// Scan-wait outcomes, kept apart so timeouts and failures are not
/// mistaken for completions.
#[derive(Debug, Serialize)]
pub struct PollSummary {
    pub sequences: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub avg_attempts: f64,
}

/// Serialize f64, clamping non-finite values (NaN, Inf) to 0.0.
fn serialize_finite_f64<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(if v.is_finite() { *v } else { 0.0 })
}

impl Report {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn step(&self, name: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Write the report to `path` atomically (temp file + rename).
    pub async fn persist(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = self.to_json().map_err(std::io::Error::other)?;

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }
}
