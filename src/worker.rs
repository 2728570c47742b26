use crate::generator::{PayloadUnreadable, RequestVariableGenerator};
use crate::model::{Config, Outcome, WorkerState};
use crate::sampler::Sampler;
use chrono::Utc;
use console::truncate_str;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Payload(#[from] PayloadUnreadable),
    #[error("payload task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sample collector went away")]
    Closed,
}

/// One virtual user: generate, upload, report, until the test duration ends.
///
/// Returns the number of completed iterations.
pub async fn worker(
    rank: usize,
    generator: Arc<RequestVariableGenerator>,
    sampler: Sampler,
    m: MultiProgress,
    config: Config,
    tx: mpsc::Sender<WorkerState>,
) -> Result<usize, WorkerError> {
    // initial delay
    tokio::time::sleep(Duration::from_secs((config.spawn_rate * rank) as u64)).await;
    let begin = Utc::now();

    let sty = ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let pb = m.add(ProgressBar::new_spinner());
    pb.set_style(sty);

    let mut ite = 0;
    while Utc::now() - begin < chrono::Duration::seconds(config.duration as i64) {
        // the payload read is blocking file I/O
        let vars = {
            let generator = Arc::clone(&generator);
            tokio::task::spawn_blocking(move || generator.generate(rank)).await?
        };
        let vars = match vars {
            Ok(vars) => vars,
            Err(e) => {
                pb.finish_with_message(format!("aborted: {e}"));
                return Err(e.into());
            }
        };
        pb.set_message("new request sent...");

        let sent = Utc::now();
        let (outcome, bytes) = match sampler.upload(&vars).await {
            Ok(receipt) => (
                Outcome::Success {
                    status: receipt.status.as_u16(),
                    db_write_time: receipt.response.and_then(|r| r.db_write_time),
                },
                receipt.bytes,
            ),
            Err(e) => {
                warn!(rank, ite, error = %e, "upload failed");
                (Outcome::Failed(e.to_string()), 0)
            }
        };
        let state = WorkerState {
            rank,
            ite,
            begin: sent,
            end: Utc::now(),
            bytes,
            outcome,
        };

        let msg = match &state.outcome {
            Outcome::Success {
                db_write_time: Some(db),
                ..
            } => format!("#{ite} {}ms (db {db})", state.latency_ms()),
            Outcome::Success { .. } => format!("#{ite} {}ms", state.latency_ms()),
            Outcome::Failed(e) => format!("error: {e}"),
        };
        pb.set_message(truncate_str(&msg, config.text_width, "...").into_owned());
        pb.tick();

        tx.send(state).await.map_err(|_| WorkerError::Closed)?;
        ite += 1;
    }
    pb.finish_with_message("finished");
    Ok(ite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::PayloadSource;
    use crate::model::{IdentityMode, UploadFormat};
    use indicatif::ProgressDrawTarget;
    use std::io::Write;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> Config {
        Config {
            vus: 1,
            duration: 1,
            spawn_rate: 0,
            text_width: 50,
            url,
            format: UploadFormat::Json,
            identity: IdentityMode::Fixed,
            timeout: 5,
        }
    }

    fn hidden() -> MultiProgress {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    }

    #[tokio::test]
    async fn worker_reports_every_iteration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let generator = Arc::new(RequestVariableGenerator::new(
            PayloadSource::per_invocation(file.path()),
            IdentityMode::Fixed,
        ));
        let config = config(server.uri());
        let sampler = Sampler::new(&config.url, config.format, Duration::from_secs(5)).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(worker(2, generator, sampler, hidden(), config, tx));

        let mut states = vec![];
        while let Some(state) = rx.recv().await {
            states.push(state);
        }
        let iterations = handle.await.unwrap().unwrap();
        assert!(iterations > 0);
        assert_eq!(states.len(), iterations);
        assert!(states.iter().all(|s| s.rank == 2 && s.is_success()));
        assert_eq!(states.last().unwrap().ite, iterations - 1);
    }

    #[tokio::test]
    async fn worker_aborts_on_unreadable_payload() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(RequestVariableGenerator::new(
            PayloadSource::per_invocation(dir.path().join("missing")),
            IdentityMode::Fixed,
        ));
        let config = config("http://127.0.0.1:9/upload/".to_string());
        let sampler = Sampler::new(&config.url, config.format, Duration::from_secs(1)).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let err = worker(0, generator, sampler, hidden(), config, tx)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Payload(_)));
        assert!(rx.recv().await.is_none());
    }
}
