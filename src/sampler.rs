//! Issues upload requests against the server under test.

use crate::generator::RequestVariableSet;
use crate::model::UploadFormat;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// File name attached to the multipart `file` part.
const PAYLOAD_FILE_NAME: &str = "payload.b64";

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("upload request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded with {0}")]
    Status(StatusCode),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Body the upload endpoint answers with, when it answers with JSON.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct UploadResponse {
    pub status: Option<String>,
    pub db_write_time: Option<String>,
}

#[derive(Clone, Debug)]
pub struct UploadReceipt {
    pub status: StatusCode,
    pub response: Option<UploadResponse>,
    /// Size of the request body, or of the payload part for multipart.
    pub bytes: u64,
}

#[derive(Clone, Debug)]
pub struct Sampler {
    client: reqwest::Client,
    url: String,
    format: UploadFormat,
}

impl Sampler {
    pub fn new(
        url: impl Into<String>,
        format: UploadFormat,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            format,
        })
    }

    pub async fn upload(&self, vars: &RequestVariableSet) -> Result<UploadReceipt, SampleError> {
        let (request, bytes) = match self.format {
            UploadFormat::Multipart => {
                let bytes = vars.value.len() as u64;
                // the upload endpoint keys the participant on `user_id`
                let mut form = Form::new().text("user_id", vars.user_id.to_string());
                for (name, value) in vars.variables() {
                    if name != "value" {
                        form = form.text(name, value);
                    }
                }
                let file = Part::text(vars.value.clone()).file_name(PAYLOAD_FILE_NAME);
                (
                    self.client.post(&self.url).multipart(form.part("file", file)),
                    bytes,
                )
            }
            UploadFormat::Json => {
                let body = serde_json::to_vec(vars)?;
                let bytes = body.len() as u64;
                let request = self
                    .client
                    .post(&self.url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body);
                (request, bytes)
            }
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SampleError::Status(status));
        }

        let body = response.bytes().await?;
        let response = serde_json::from_slice::<UploadResponse>(&body).ok();
        trace!(%status, ?response, bytes, "upload accepted");

        Ok(UploadReceipt {
            status,
            response,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vars() -> RequestVariableSet {
        RequestVariableSet {
            user_id: 24,
            session_key: "participant24".to_string(),
            campaign_id: 0,
            timestamp: 1_610_124_788_000,
            data_source: 0,
            accuracy: 12345.6789,
            value: "aGVsbG8gd29ybGQ".to_string(),
        }
    }

    fn sampler(server: &MockServer, format: UploadFormat) -> Sampler {
        Sampler::new(
            format!("{}/upload/", server.uri()),
            format,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn json_upload_sends_camel_case_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({
                "userId": 24,
                "sessionKey": "participant24",
                "campaignId": 0,
                "timestamp": 1_610_124_788_000_i64,
                "dataSource": 0,
                "accuracy": 12345.6789,
                "value": "aGVsbG8gd29ybGQ",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "db_write_time": "3 ms",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = sampler(&server, UploadFormat::Json)
            .upload(&vars())
            .await
            .unwrap();

        assert_eq!(receipt.status, StatusCode::OK);
        assert_eq!(
            receipt.response,
            Some(UploadResponse {
                status: Some("success".to_string()),
                db_write_time: Some("3 ms".to_string()),
            })
        );
        assert!(receipt.bytes > vars().value.len() as u64);
    }

    #[tokio::test]
    async fn multipart_upload_carries_user_and_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/"))
            .and(body_string_contains("name=\"user_id\""))
            .and(body_string_contains("name=\"sessionKey\"\r\n\r\nparticipant24"))
            .and(body_string_contains("name=\"accuracy\"\r\n\r\n12345.6789"))
            .and(body_string_contains("name=\"file\"; filename=\"payload.b64\""))
            .and(body_string_contains("aGVsbG8gd29ybGQ"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = sampler(&server, UploadFormat::Multipart)
            .upload(&vars())
            .await
            .unwrap();

        assert_eq!(receipt.bytes, 15);
        assert_eq!(receipt.response, None);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = sampler(&server, UploadFormat::Json)
            .upload(&vars())
            .await
            .unwrap_err();

        assert!(matches!(err, SampleError::Status(status) if status == StatusCode::SERVICE_UNAVAILABLE));
    }
}
