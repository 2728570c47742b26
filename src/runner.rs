//! Spawns the virtual users of one run and gathers their samples.

use crate::generator::RequestVariableGenerator;
use crate::model::{Config, WorkerState};
use crate::report::RunReport;
use crate::sampler::Sampler;
use crate::worker::worker;
use chrono::Utc;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("sample collector panicked: {0}")]
    Collector(#[from] tokio::task::JoinError),
}

pub fn seconds_to_hms(seconds: usize) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Runs `config.vus` virtual users against `config.url` and summarizes them.
pub async fn run(
    config: &Config,
    generator: Arc<RequestVariableGenerator>,
    m: MultiProgress,
) -> Result<RunReport, RunError> {
    let sampler = Sampler::new(
        &config.url,
        config.format,
        Duration::from_secs(config.timeout as u64),
    )?;
    info!(
        vus = config.vus,
        duration = config.duration,
        url = %config.url,
        payload = %generator.source().path().display(),
        "starting run"
    );

    let sty = ProgressStyle::with_template("{spinner} {elapsed_precise}/{msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let total_duration = config.duration + config.spawn_rate * config.vus;
    let pb = m.add(ProgressBar::new((total_duration * 10) as u64));
    pb.set_style(sty);
    pb.set_message(seconds_to_hms(total_duration));

    let (tx, mut rx) = mpsc::channel(config.vus.max(1) * 4);
    let started = Instant::now();

    let mut set = JoinSet::new();
    for rank in 0..config.vus {
        set.spawn(worker(
            rank,
            Arc::clone(&generator),
            sampler.clone(),
            m.clone(),
            config.clone(),
            tx.clone(),
        ));
    }

    drop(tx);

    let h = tokio::spawn(async move {
        let mut data: Vec<WorkerState> = vec![];
        let mut heap = BinaryHeap::new();
        let window = 1;
        while let Some(worker_state) = rx.recv().await {
            heap.push(Reverse(worker_state.end));
            data.push(worker_state);
            let ts = Utc::now();
            while heap
                .peek()
                .is_some_and(|Reverse(end)| *end < ts - chrono::Duration::seconds(window))
            {
                heap.pop();
            }
            let rps = heap.len() as f64 / window as f64;
            pb.set_message(format!(
                "{} {:.2} aggregated requests/s",
                seconds_to_hms(total_duration),
                rps
            ));
            pb.tick();
        }
        pb.finish();

        data
    });

    let mut worker_errors = vec![];
    while let Some(res) = set.join_next().await {
        match res {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "virtual user aborted");
                worker_errors.push(e.to_string());
            }
            Err(e) => {
                warn!(error = %e, "virtual user panicked");
                worker_errors.push(e.to_string());
            }
        }
    }

    let data = h.await?;
    let report = RunReport::new(config, &data, started.elapsed(), worker_errors);
    info!(
        vus = report.vus,
        requests = report.requests,
        failures = report.failures,
        "run finished"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hms_formatting() {
        assert_eq!(seconds_to_hms(0), "00:00:00");
        assert_eq!(seconds_to_hms(59), "00:00:59");
        assert_eq!(seconds_to_hms(3_725), "01:02:05");
    }
}
