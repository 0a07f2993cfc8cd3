//! reqwest-backed client for the job endpoints.

use std::time::Duration;

use async_trait::async_trait;
use devjobs_common::{BuildRequest, JobId, JobSummary, OutputSlice, SubmitResponse, TestRunRequest};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::JobApi;
use crate::errors::ClientError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Ceiling for the short request/response calls; push streams have none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct JobsClient {
    http: reqwest::Client,
    base_url: reqwest::Url,
    token: String,
}

impl JobsClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| ClientError::Config(format!("Invalid server URL '{base_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("devjobs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::Config(format!("Invalid request path '{path}': {e}")))
    }

    fn get(&self, path: &str) -> Result<RequestBuilder, ClientError> {
        Ok(self
            .http
            .get(self.url(path)?)
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder, ClientError> {
        Ok(self.http.post(self.url(path)?).bearer_auth(&self.token))
    }

    /// Open `POST /jobs/build/stream`; read the body with `bytes_stream()`.
    pub async fn stream_build(&self, target: &str) -> Result<Response, ClientError> {
        let request = self.post("jobs/build/stream")?.json(&BuildRequest {
            target: target.to_string(),
        });
        check(request.send().await?, None).await
    }

    /// Open `POST /jobs/build/rebuild`.
    pub async fn stream_rebuild(&self) -> Result<Response, ClientError> {
        let request = self
            .post("jobs/build/rebuild")?
            .json(&serde_json::json!({}));
        check(request.send().await?, None).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError> {
        json(self.get("jobs")?, None).await
    }

    pub async fn job(&self, id: &JobId) -> Result<JobSummary, ClientError> {
        json(self.get(&format!("jobs/{id}"))?, Some(id)).await
    }
}

#[async_trait]
impl JobApi for JobsClient {
    async fn submit(&self, request: &TestRunRequest) -> Result<JobId, ClientError> {
        let submitted: SubmitResponse = json(
            self.post("jobs/tests/run")?.timeout(REQUEST_TIMEOUT).json(request),
            None,
        )
        .await?;
        debug!(job_id = %submitted.job_id, "Test run submitted");
        Ok(submitted.job_id)
    }

    async fn status(&self, id: &JobId, offset: usize) -> Result<OutputSlice, ClientError> {
        let request = self
            .get(&format!("jobs/tests/status/{id}"))?
            .query(&[("offset", offset)]);
        json(request, Some(id)).await
    }

    async fn coverage_summary(&self) -> Result<serde_json::Value, ClientError> {
        json(self.get("jobs/tests/coverage")?, None).await
    }

    async fn cancel(&self, id: &JobId) -> Result<JobSummary, ClientError> {
        json(
            self.post(&format!("jobs/{id}/cancel"))?
                .timeout(REQUEST_TIMEOUT),
            Some(id),
        )
        .await
    }
}

async fn json<T: DeserializeOwned>(
    request: RequestBuilder,
    id: Option<&JobId>,
) -> Result<T, ClientError> {
    let response = check(request.send().await?, id).await?;
    Ok(response.json::<T>().await?)
}

/// Turn non-success responses into typed errors, reading the server's
/// `{"error": ...}` body when there is one.
async fn check(response: Response, id: Option<&JobId>) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });

    Err(match status {
        StatusCode::UNAUTHORIZED => ClientError::NotAuthorized(message),
        StatusCode::NOT_FOUND => ClientError::NotFound {
            id: id.map(ToString::to_string).unwrap_or(message),
        },
        _ => ClientError::Server {
            status: status.as_u16(),
            message,
        },
    })
}

fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .or_else(|| Some(trimmed.to_string()))
}
