//! Durable, append-only timing log and its summary report.
//!
//! One line per completed request:
//! `2026-01-02T03:04:05Z request=3 cold_start_s=0.00 inference_s=7.41`

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

pub const NO_DATA_REPORT: &str = "No timing records yet. Run at least one generation.\n";

#[derive(Debug, Clone, PartialEq)]
pub struct TimingRecord {
    pub timestamp: DateTime<Utc>,
    pub request: u64,
    pub cold_start_seconds: f64,
    pub inference_seconds: f64,
}

impl fmt::Display for TimingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} request={} cold_start_s={:.2} inference_s={:.2}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.request,
            self.cold_start_seconds,
            self.inference_seconds
        )
    }
}

/// Cold-start and inference seconds read back from one log line.
///
/// Lines missing either field, or carrying unparsable numbers, yield `None`.
/// Unknown tokens are ignored.
pub fn parse_line(line: &str) -> Option<(f64, f64)> {
    let mut cold_start = None;
    let mut inference = None;
    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix("cold_start_s=") {
            cold_start = Some(value.parse().ok()?);
        } else if let Some(value) = token.strip_prefix("inference_s=") {
            inference = Some(value.parse().ok()?);
        }
    }
    Some((cold_start?, inference?))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingSummary {
    pub count: usize,
    pub total_cold_start: f64,
    pub avg_inference: f64,
    pub min_inference: f64,
    pub max_inference: f64,
}

impl TimingSummary {
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let samples: Vec<(f64, f64)> = lines.into_iter().filter_map(parse_line).collect();
        let count = samples.len();
        let total_cold_start = samples.iter().map(|(cold, _)| cold).sum();
        let inference = samples.iter().map(|&(_, inference)| inference);
        let (avg_inference, min_inference, max_inference) = if count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (
                inference.clone().sum::<f64>() / count as f64,
                inference.clone().fold(f64::INFINITY, f64::min),
                inference.fold(f64::NEG_INFINITY, f64::max),
            )
        };
        Self {
            count,
            total_cold_start,
            avg_inference,
            min_inference,
            max_inference,
        }
    }
}

impl fmt::Display for TimingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Nova Anime timing report ===")?;
        writeln!(f, "Total requests: {}", self.count)?;
        writeln!(f, "Cold start (first request only): {:.2}s", self.total_cold_start)?;
        writeln!(
            f,
            "Inference: avg={:.2}s min={:.2}s max={:.2}s",
            self.avg_inference, self.min_inference, self.max_inference
        )?;
        writeln!(f, "--- Per-request detail ---")
    }
}

#[derive(Debug, Clone)]
pub struct TimingLog {
    path: PathBuf,
}

impl TimingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record as a single write so concurrent appenders never
    /// interleave partial lines.
    pub fn append(&self, record: &TimingRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format!("{record}\n").as_bytes())
    }

    /// Summary block followed by every line of the log, verbatim.
    ///
    /// Never fails: a missing or empty log gives [`NO_DATA_REPORT`] and read
    /// errors are described in the returned text.
    pub fn summarize(&self) -> String {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return NO_DATA_REPORT.to_string(),
            Err(err) => return format!("Error reading timing report: {err}\n"),
        };
        let content = content.trim();
        if content.is_empty() {
            return NO_DATA_REPORT.to_string();
        }
        let summary = TimingSummary::from_lines(content.lines());
        format!("{summary}{content}\n")
    }
}
