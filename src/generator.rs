//! Per virtual user request preparation.
//!
//! Every simulated participant turns its worker index and the payload file
//! into a [`RequestVariableSet`] before handing it to the sampler.

use crate::model::IdentityMode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// User id every virtual user reports in [`IdentityMode::Fixed`].
pub const FIXED_USER_ID: u64 = 24;
pub const SESSION_KEY_PREFIX: &str = "participant";
pub const CAMPAIGN_ID: i64 = 0;
pub const DATA_SOURCE_ID: i64 = 0;
pub const ACCURACY: f64 = 12345.6789;

#[derive(Debug, thiserror::Error)]
#[error("payload file {} is unreadable", .path.display())]
pub struct PayloadUnreadable {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// The variables one upload request is built from.
///
/// Serializes with the camelCase names the upload endpoint expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVariableSet {
    pub user_id: u64,
    pub session_key: String,
    pub campaign_id: i64,
    /// Unix time in milliseconds, captured at generation.
    pub timestamp: i64,
    pub data_source: i64,
    pub accuracy: f64,
    /// Base64 of the payload with the trailing `=` padding removed.
    pub value: String,
}

impl RequestVariableSet {
    /// Name to value view of the set; multipart uploads send these as form fields.
    pub fn variables(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("userId", self.user_id.to_string()),
            ("sessionKey", self.session_key.clone()),
            ("campaignId", self.campaign_id.to_string()),
            ("timestamp", self.timestamp.to_string()),
            ("dataSource", self.data_source.to_string()),
            ("accuracy", self.accuracy.to_string()),
            ("value", self.value.clone()),
        ])
    }
}

/// Encodes text as standard base64 and drops the `=` padding.
///
/// Receivers have to re-pad or use a non-padded decoder.
pub fn encode_payload(text: &str) -> String {
    let mut encoded = STANDARD.encode(text.as_bytes());
    let trimmed = encoded.trim_end_matches('=').len();
    encoded.truncate(trimmed);
    encoded
}

fn read_payload(path: &Path) -> Result<String, PayloadUnreadable> {
    std::fs::read_to_string(path).map_err(|source| PayloadUnreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// Where the encoded payload comes from.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    /// Open, read and encode the file on every invocation.
    PerInvocation(PathBuf),
    /// Read and encode once, share the result between invocations.
    Cached { path: PathBuf, encoded: Arc<str> },
}

impl PayloadSource {
    pub fn per_invocation(path: impl Into<PathBuf>) -> Self {
        Self::PerInvocation(path.into())
    }

    pub fn cached(path: impl Into<PathBuf>) -> Result<Self, PayloadUnreadable> {
        let path = path.into();
        let encoded = encode_payload(&read_payload(&path)?);
        debug!(path = %path.display(), encoded_len = encoded.len(), "payload cached");
        Ok(Self::Cached {
            path,
            encoded: encoded.into(),
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::PerInvocation(path) => path,
            Self::Cached { path, .. } => path,
        }
    }

    fn encoded(&self) -> Result<String, PayloadUnreadable> {
        match self {
            Self::PerInvocation(path) => {
                let text = read_payload(path)?;
                trace!(path = %path.display(), len = text.len(), "payload read");
                Ok(encode_payload(&text))
            }
            Self::Cached { encoded, .. } => Ok(encoded.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestVariableGenerator {
    source: PayloadSource,
    identity: IdentityMode,
}

impl RequestVariableGenerator {
    pub fn new(source: PayloadSource, identity: IdentityMode) -> Self {
        Self { source, identity }
    }

    pub fn source(&self) -> &PayloadSource {
        &self.source
    }

    /// Builds the variables for the virtual user at `worker_index`.
    ///
    /// Fails only when the payload cannot be read as UTF-8 text; no partial
    /// set is ever returned.
    pub fn generate(&self, worker_index: usize) -> Result<RequestVariableSet, PayloadUnreadable> {
        let user_ordinal = (worker_index as u64).saturating_add(1);
        let value = self.source.encoded()?;
        trace!(worker_index, encoded_len = value.len(), "payload encoded");

        let user_id = match self.identity {
            IdentityMode::Fixed => FIXED_USER_ID,
            IdentityMode::PerWorker => user_ordinal,
        };
        let session_key = format!("{SESSION_KEY_PREFIX}{user_id}");
        let timestamp = Utc::now().timestamp_millis();
        debug!(worker_index, user_ordinal, user_id, %session_key, timestamp, "request variables ready");

        Ok(RequestVariableSet {
            user_id,
            session_key,
            campaign_id: CAMPAIGN_ID,
            timestamp,
            data_source: DATA_SOURCE_ID,
            accuracy: ACCURACY,
            value,
        })
    }
}

/// One-shot generation with the fixed identity, reading `payload_path` once.
pub fn generate(
    worker_index: usize,
    payload_path: impl AsRef<Path>,
) -> Result<RequestVariableSet, PayloadUnreadable> {
    RequestVariableGenerator::new(
        PayloadSource::per_invocation(payload_path.as_ref()),
        IdentityMode::Fixed,
    )
    .generate(worker_index)
}
