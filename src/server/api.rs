use std::str::FromStr;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use devjobs_common::{BuildRequest, JobId, SubmitResponse, TestRunRequest};
use serde::Deserialize;
use tracing::{info, warn};

use super::SharedState;
use super::auth::{self, SharedVerifier};
use super::push;
use crate::errors::JobError;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OffsetQuery {
    #[serde(default)]
    pub offset: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::NotFound { .. } => ApiError::NotFound(message),
            JobError::InvalidOffset { .. } | JobError::UnknownTarget { .. } => {
                ApiError::BadRequest(message)
            }
            JobError::TooManyJobs { .. } => ApiError::TooManyRequests(message),
            JobError::Spawn { .. } => {
                warn!(error = %message, "Job request failed");
                ApiError::Internal(message)
            }
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    // A malformed id can never name a job.
    JobId::from_str(raw).map_err(|_| ApiError::NotFound(format!("Job {raw} not found")))
}

// ── Router ────────────────────────────────────────────────────────────

/// Job routes behind the bearer check, plus the open health check.
pub fn api_router(verifier: SharedVerifier) -> Router<SharedState> {
    let jobs = Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/build/stream", post(build_stream))
        .route("/jobs/build/rebuild", post(rebuild_stream))
        .route("/jobs/tests/run", post(run_tests))
        .route("/jobs/tests/status/{job_id}", get(test_status))
        .route("/jobs/tests/coverage", get(coverage_summary))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .route_layer(middleware::from_fn_with_state(
            verifier,
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(jobs)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn build_stream(
    State(state): State<SharedState>,
    Json(req): Json<BuildRequest>,
) -> Result<Response, ApiError> {
    let spec = state.config.build_spec(&req.target, &state.project_dir)?;
    let job_id = state.runner.start(spec)?;
    info!(%job_id, target = %req.target, "Build started");
    Ok(push::push_response(
        state.runner.registry().clone(),
        job_id,
        Some(req.target),
    ))
}

async fn rebuild_stream(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let spec = state.config.rebuild_spec(&state.project_dir);
    let job_id = state.runner.start(spec)?;
    info!(%job_id, "Rebuild started");
    Ok(push::push_response(
        state.runner.registry().clone(),
        job_id,
        None,
    ))
}

async fn run_tests(
    State(state): State<SharedState>,
    Json(req): Json<TestRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = state.config.test_spec(&req, &state.project_dir);
    let job_id = state.runner.start(spec)?;
    info!(%job_id, pattern = %req.pattern, coverage = req.coverage, "Test run submitted");
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

async fn test_status(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
    Query(query): Query<OffsetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&job_id)?;
    let slice = state.runner.registry().read(&id, query.offset)?;
    Ok(Json(slice))
}

async fn coverage_summary(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state.project_dir.join(&state.config.tests.coverage_summary);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(
                "No coverage summary available; run tests with coverage first".to_string(),
            ));
        }
        Err(e) => {
            return Err(ApiError::Internal(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )));
        }
    };
    let summary: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        ApiError::Internal(format!("Invalid coverage summary {}: {}", path.display(), e))
    })?;
    Ok(Json(summary))
}

async fn list_jobs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.runner.registry().list())
}

async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&job_id)?;
    Ok(Json(state.runner.registry().summary(&id)?))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&job_id)?;
    let summary = state.runner.registry().cancel(&id)?;
    info!(job_id = %id, status = %summary.status, "Cancel requested");
    Ok(Json(summary))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevJobsToml;
    use crate::jobs::{CommandRunner, JobRegistry, RetentionPolicy, RunnerSettings};
    use crate::server::AppState;
    use crate::server::auth::StaticTokenVerifier;
    use axum::body::Body;
    use axum::http::{Request, header};
    use devjobs_common::{FailureKind, JobStatus, JobSummary, OutputSlice};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn test_state(config: DevJobsToml, project_dir: &std::path::Path) -> SharedState {
        let registry = Arc::new(JobRegistry::new(RetentionPolicy::default()));
        Arc::new(AppState {
            runner: CommandRunner::new(registry, RunnerSettings::default()),
            config: Arc::new(config),
            project_dir: project_dir.to_path_buf(),
        })
    }

    fn test_app_with(state: SharedState) -> Router {
        api_router(Arc::new(StaticTokenVerifier::new(TOKEN))).with_state(state)
    }

    fn test_app() -> (Router, SharedState) {
        let state = test_state(DevJobsToml::default(), std::path::Path::new("."));
        (test_app_with(state.clone()), state)
    }

    fn authed(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_needs_no_token() {
        let (app, _) = test_app();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_jobs_routes_require_token() {
        let (app, _) = test_app();
        let request = Request::builder()
            .uri("/jobs")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("Missing"));

        let request = Request::builder()
            .uri("/jobs")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_jobs_empty() {
        let (app, _) = test_app();
        let response = app
            .oneshot(authed("GET", "/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let jobs: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_status_reads_incrementally() {
        let (app, state) = test_app();
        let (id, writer) = state.runner.registry().create("tests").unwrap();
        writer.mark_running();
        writer.append("PASS a.test.ts\n");

        let uri = format!("/jobs/tests/status/{id}?offset=0");
        let response = app
            .clone()
            .oneshot(authed("GET", &uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first: OutputSlice = body_json(response.into_body()).await;
        assert_eq!(first.data, "PASS a.test.ts\n");
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.exit_code, None);

        writer.append("FAIL b.test.ts\n");
        writer.finish(JobStatus::Error, Some(1), Some(FailureKind::NonZeroExit));

        let uri = format!("/jobs/tests/status/{id}?offset={}", first.full_length);
        let response = app
            .oneshot(authed("GET", &uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let second: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(second["output"], "FAIL b.test.ts\n");
        assert_eq!(second["fullLength"], 30);
        assert_eq!(second["status"], "error");
        assert_eq!(second["exitCode"], 1);
    }

    #[tokio::test]
    async fn test_status_unknown_and_malformed_ids_are_404() {
        let (app, _) = test_app();
        for uri in [
            format!("/jobs/tests/status/{}", JobId::new()),
            "/jobs/tests/status/not-a-uuid".to_string(),
        ] {
            let response = app
                .clone()
                .oneshot(authed("GET", &uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_status_split_offset_is_400() {
        let (app, state) = test_app();
        let (id, writer) = state.runner.registry().create("tests").unwrap();
        writer.append("é");

        let uri = format!("/jobs/tests/status/{id}?offset=1");
        let response = app
            .oneshot(authed("GET", &uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_build_target_is_400() {
        let (app, state) = test_app();
        let response = app
            .oneshot(
                authed("POST", "/jobs/build/stream")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"target":"mobile"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.runner.registry().is_empty());
    }

    #[tokio::test]
    async fn test_get_and_cancel_job() {
        let (app, state) = test_app();
        let (id, writer) = state.runner.registry().create("tests").unwrap();
        writer.mark_running();
        let token = writer.cancel_token();

        let response = app
            .clone()
            .oneshot(
                authed("POST", &format!("/jobs/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary: JobSummary = body_json(response.into_body()).await;
        assert!(summary.cancel_requested);
        assert!(token.is_cancelled());

        let response = app
            .oneshot(authed("GET", &format!("/jobs/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let summary: JobSummary = body_json(response.into_body()).await;
        assert_eq!(summary.id, id);
        assert_eq!(summary.label, "tests");
    }

    #[tokio::test]
    async fn test_too_many_jobs_is_429() {
        let registry = Arc::new(JobRegistry::new(RetentionPolicy {
            max_running_jobs: 1,
            ..RetentionPolicy::default()
        }));
        let state = Arc::new(AppState {
            runner: CommandRunner::new(registry, RunnerSettings::default()),
            config: Arc::new(DevJobsToml::default()),
            project_dir: ".".into(),
        });
        let (_id, _writer) = state.runner.registry().create("busy").unwrap();

        let response = test_app_with(state)
            .oneshot(
                authed("POST", "/jobs/tests/run")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_coverage_summary() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(DevJobsToml::default(), dir.path());
        let app = test_app_with(state);

        let response = app
            .clone()
            .oneshot(authed("GET", "/jobs/tests/coverage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let path = dir.path().join("backend/coverage/coverage-summary.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"total":{"lines":{"pct":87.5}}}"#).unwrap();

        let response = app
            .oneshot(authed("GET", "/jobs/tests/coverage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["total"]["lines"]["pct"], 87.5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tests_returns_job_id_immediately() {
        let config = DevJobsToml::parse(
            r#"
            [tests]
            program = "sh"
            args = ["-c", "echo running; sleep 0.2; echo finished"]
            pattern_args = []
            cwd = "."
            "#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(config, dir.path());
        let app = test_app_with(state.clone());

        let response = app
            .oneshot(
                authed("POST", "/jobs/tests/run")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"pattern":"","coverage":false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let submitted: SubmitResponse = body_json(response.into_body()).await;

        let summary = state.runner.registry().summary(&submitted.job_id).unwrap();
        assert!(!summary.status.is_terminal());

        let mut changes = state.runner.registry().subscribe(&submitted.job_id).unwrap();
        while !state
            .runner
            .registry()
            .summary(&submitted.job_id)
            .unwrap()
            .status
            .is_terminal()
        {
            if changes.changed().await.is_err() {
                break;
            }
        }
        let slice = state.runner.registry().read(&submitted.job_id, 0).unwrap();
        assert_eq!(slice.status, JobStatus::Completed);
        assert_eq!(slice.data, "running\nfinished\n");
    }
}
