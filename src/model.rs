use clap::ValueEnum;
use serde::Serialize;

/// How a virtual user derives `userId` and `sessionKey`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    /// Every virtual user reports user 24 and `participant24`.
    #[default]
    Fixed,
    /// Worker index + 1 is the user id.
    PerWorker,
}

/// Encoding of the upload request body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadFormat {
    #[default]
    Multipart,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub vus: usize,
    pub duration: usize,
    pub spawn_rate: usize,
    pub text_width: usize,
    pub url: String,
    pub format: UploadFormat,
    pub identity: IdentityMode,
    pub timeout: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success {
        status: u16,
        db_write_time: Option<String>,
    },
    Failed(String),
}

#[derive(Debug)]
pub struct WorkerState {
    pub rank: usize,
    pub ite: usize,
    pub begin: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub bytes: u64,
    pub outcome: Outcome,
}

impl WorkerState {
    pub fn latency_ms(&self) -> i64 {
        (self.end - self.begin).num_milliseconds()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}
