//! Summary of one load run.

use crate::model::{Config, IdentityMode, UploadFormat, WorkerState};
use console::style;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub p50_ms: i64,
    pub p90_ms: i64,
    pub p99_ms: i64,
    pub max_ms: i64,
}

impl LatencySummary {
    /// Nearest-rank percentiles over the given latencies, `None` when empty.
    pub fn from_millis(mut samples: Vec<i64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let rank = |q: f64| {
            let idx = (q * samples.len() as f64).ceil() as usize;
            samples[idx.clamp(1, samples.len()) - 1]
        };

        Some(Self {
            avg_ms: samples.iter().sum::<i64>() as f64 / samples.len() as f64,
            p50_ms: rank(0.5),
            p90_ms: rank(0.9),
            p99_ms: rank(0.99),
            max_ms: samples[samples.len() - 1],
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub vus: usize,
    pub duration_secs: usize,
    pub format: UploadFormat,
    pub identity: IdentityMode,
    pub elapsed_ms: u128,
    pub requests: usize,
    pub failures: usize,
    pub bytes_sent: u64,
    pub successful_requests_per_sec: f64,
    pub latency: Option<LatencySummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub worker_errors: Vec<String>,
}

impl RunReport {
    pub fn new(
        config: &Config,
        samples: &[WorkerState],
        elapsed: Duration,
        worker_errors: Vec<String>,
    ) -> Self {
        let successes: Vec<_> = samples.iter().filter(|s| s.is_success()).collect();
        let secs = elapsed.as_secs_f64();
        let successful_requests_per_sec = if secs > 0.0 {
            successes.len() as f64 / secs
        } else {
            0.0
        };

        Self {
            vus: config.vus,
            duration_secs: config.duration,
            format: config.format,
            identity: config.identity,
            elapsed_ms: elapsed.as_millis(),
            requests: samples.len(),
            failures: samples.len() - successes.len(),
            bytes_sent: successes.iter().map(|s| s.bytes).sum(),
            successful_requests_per_sec,
            latency: LatencySummary::from_millis(
                successes.iter().map(|s| s.latency_ms()).collect(),
            ),
            worker_errors,
        }
    }

    pub fn print(&self) {
        println!();
        println!(
            "{} {} virtual users, {:?} uploads, {}s",
            style("##").bold(),
            style(self.vus).bold().blue(),
            self.format,
            self.duration_secs
        );
        print!("  {} requests", style(self.requests).bold());
        if self.failures > 0 {
            print!(
                ", {}",
                style(format!("{} FAILURES", self.failures)).bold().red()
            );
        }
        println!(
            ", {:.2} successful requests/s, {} bytes sent",
            style(self.successful_requests_per_sec).bold(),
            self.bytes_sent
        );
        if let Some(latency) = &self.latency {
            println!(
                "  response time avg: {:.2}ms; p50: {}ms; p90: {}ms; p99: {}ms; max: {}ms",
                style(latency.avg_ms).bold(),
                latency.p50_ms,
                latency.p90_ms,
                latency.p99_ms,
                latency.max_ms
            );
        }
        for err in &self.worker_errors {
            println!("  {} {err}", style("worker aborted:").red());
        }
    }
}

/// Appends the reports to the JSON array stored at `path`, creating it when
/// missing or empty.
pub fn append_json(reports: &[RunReport], path: &Path) -> io::Result<()> {
    let mut all: Vec<Value> = match fs::read(path) {
        Ok(existing) if !existing.iter().all(u8::is_ascii_whitespace) => {
            serde_json::from_slice(&existing)?
        }
        Ok(_) => vec![],
        Err(e) if e.kind() == io::ErrorKind::NotFound => vec![],
        Err(e) => return Err(e),
    };
    for report in reports {
        all.push(serde_json::to_value(report)?);
    }

    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &all)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Outcome;
    use chrono::{TimeZone, Utc};

    fn sample(latency_ms: i64, outcome: Outcome) -> WorkerState {
        let begin = Utc.timestamp_millis_opt(1_610_124_788_000).unwrap();
        WorkerState {
            rank: 0,
            ite: 0,
            begin,
            end: begin + chrono::Duration::milliseconds(latency_ms),
            bytes: 100,
            outcome,
        }
    }

    fn ok() -> Outcome {
        Outcome::Success {
            status: 200,
            db_write_time: None,
        }
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let summary = LatencySummary::from_millis((1..=100).rev().collect()).unwrap();
        assert_eq!(summary.p50_ms, 50);
        assert_eq!(summary.p90_ms, 90);
        assert_eq!(summary.p99_ms, 99);
        assert_eq!(summary.max_ms, 100);
        assert_eq!(summary.avg_ms, 50.5);

        let single = LatencySummary::from_millis(vec![7]).unwrap();
        assert_eq!((single.p50_ms, single.p99_ms), (7, 7));
        assert_eq!(LatencySummary::from_millis(vec![]), None);
    }

    #[test]
    fn failures_are_counted_but_not_timed() {
        let config = Config {
            vus: 16,
            duration: 2,
            spawn_rate: 0,
            text_width: 50,
            url: "http://localhost:8000/upload/".to_string(),
            format: UploadFormat::Multipart,
            identity: IdentityMode::Fixed,
            timeout: 30,
        };
        let samples = vec![
            sample(10, ok()),
            sample(30, ok()),
            sample(5_000, Outcome::Failed("timed out".to_string())),
        ];

        let report = RunReport::new(&config, &samples, Duration::from_secs(2), vec![]);
        assert_eq!(report.requests, 3);
        assert_eq!(report.failures, 1);
        assert_eq!(report.bytes_sent, 200);
        assert_eq!(report.successful_requests_per_sec, 1.0);
        assert_eq!(report.latency.unwrap().max_ms, 30);
    }

    fn report(vus: usize) -> RunReport {
        RunReport {
            vus,
            duration_secs: 30,
            format: UploadFormat::Json,
            identity: IdentityMode::Fixed,
            elapsed_ms: 30_000,
            requests: 10,
            failures: 0,
            bytes_sent: 1_000,
            successful_requests_per_sec: 0.33,
            latency: LatencySummary::from_millis(vec![12, 15]),
            worker_errors: vec![],
        }
    }

    #[test]
    fn json_reports_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.json");

        append_json(&[report(16), report(32)], &path).unwrap();
        append_json(&[report(64)], &path).unwrap();

        let stored: Vec<Value> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let vus: Vec<_> = stored.iter().map(|r| r["vus"].as_u64().unwrap()).collect();
        assert_eq!(vus, [16, 32, 64]);
        assert_eq!(stored[0]["format"], "json");
        assert_eq!(stored[2]["latency"]["p50_ms"], 12);
    }

    #[test]
    fn empty_report_file_is_started_fresh() {
        let file = tempfile::NamedTempFile::new().unwrap();
        append_json(&[report(8192)], file.path()).unwrap();

        let stored: Vec<Value> = serde_json::from_slice(&fs::read(file.path()).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn malformed_report_file_is_left_alone() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), "not json").unwrap();

        assert!(append_json(&[report(16)], file.path()).is_err());
        assert_eq!(fs::read_to_string(file.path()).unwrap(), "not json");
    }
}
