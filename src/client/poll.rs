//! Timer-driven consumer for the pull transport.
//!
//! ```text
//!   Idle ──start()──> Polling{job_id, offset} ──terminal status──> Terminal(Finished)
//!                        │  ▲      │
//!                   tick │  │ re-arm (running / transient error)
//!                        ▼  │      ├──stop()────────> Terminal(Stopped)
//!                     status()     ├──deadline──────> Terminal(TimedOut)
//!                                  └──fatal error───> Terminal(Failed)
//! ```
//!
//! At most one status request is in flight: the timer is only re-armed after
//! the previous response has been applied.

use std::time::Duration;

use devjobs_common::markers::{STOPPED_MARKER, TIMEOUT_MARKER};
use devjobs_common::{FailureKind, JobId, JobStatus, OutputSlice, TestRunRequest};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::JobApi;
use super::log::LogSink;
use crate::errors::ClientError;

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Wait before the first status read.
    pub initial_delay: Duration,
    /// Wall-clock ceiling for the whole run, independent of `interval`.
    pub overall_timeout: Duration,
    /// Also cancel the server-side job when polling is stopped.
    pub cancel_on_stop: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            initial_delay: Duration::from_secs(1),
            overall_timeout: Duration::from_secs(600),
            cancel_on_stop: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The server reported a terminal job status.
    Finished {
        status: JobStatus,
        exit_code: Option<i32>,
        duration: Option<f64>,
        failure: Option<FailureKind>,
    },
    /// The user stopped watching.
    Stopped,
    /// The overall deadline passed while the job was still running.
    TimedOut,
    /// A client-side error ended polling (unknown job, rejected token, ...).
    Failed(String),
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Finished {
                status: JobStatus::Completed,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Idle,
    Polling { job_id: JobId, offset: usize },
    Terminal(PollOutcome),
}

/// A cancellable one-shot tick.
#[derive(Debug, Default)]
pub struct PollTimer {
    due: Option<Instant>,
}

impl PollTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer to fire after `after`.
    pub fn schedule(&mut self, after: Duration) {
        self.due = Some(Instant::now() + after);
    }

    pub fn clear(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    /// Resolves when the armed tick is due; never resolves while disarmed.
    pub async fn fired(&self) {
        match self.due {
            Some(due) => sleep_until(due).await,
            None => std::future::pending().await,
        }
    }
}

enum Wake {
    Stop,
    Deadline,
    Tick,
}

enum Inflight {
    Stop,
    Deadline,
    Done(Result<OutputSlice, ClientError>),
}

pub struct PollConsumer<A: JobApi, L: LogSink> {
    api: A,
    log: L,
    settings: PollSettings,
    request: TestRunRequest,
    state: PollState,
    timer: PollTimer,
    deadline: Option<Instant>,
    coverage: Option<serde_json::Value>,
}

impl<A: JobApi, L: LogSink> PollConsumer<A, L> {
    pub fn new(api: A, log: L, settings: PollSettings) -> Self {
        Self {
            api,
            log,
            settings,
            request: TestRunRequest::default(),
            state: PollState::Idle,
            timer: PollTimer::new(),
            deadline: None,
            coverage: None,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self.state {
            PollState::Polling { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    pub fn timer(&self) -> &PollTimer {
        &self.timer
    }

    /// Coverage summary fetched after a successful run with coverage enabled.
    pub fn coverage(&self) -> Option<&serde_json::Value> {
        self.coverage.as_ref()
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn into_log(self) -> L {
        self.log
    }

    pub fn outcome(&self) -> Option<&PollOutcome> {
        match &self.state {
            PollState::Terminal(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Submit the run and arm the first tick. Only valid from `Idle`.
    pub async fn start(&mut self, request: TestRunRequest) -> Result<JobId, ClientError> {
        if self.state != PollState::Idle {
            return Err(ClientError::Config(
                "poll consumer has already been started".to_string(),
            ));
        }

        match self.api.submit(&request).await {
            Ok(job_id) => {
                info!(%job_id, "Polling test run");
                self.log.notice(&format!("▶ Test run {job_id} started\n"));
                self.request = request;
                self.state = PollState::Polling { job_id, offset: 0 };
                self.timer.schedule(self.settings.initial_delay);
                self.deadline = Some(Instant::now() + self.settings.overall_timeout);
                Ok(job_id)
            }
            Err(e) => {
                self.log.notice(&format!("✗ Failed to start test run: {e}\n"));
                self.state = PollState::Terminal(PollOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Issue one status read and apply it. No-op unless polling.
    pub async fn poll_once(&mut self) -> &PollState {
        if let PollState::Polling { job_id, offset } = self.state {
            self.timer.clear();
            let result = self.api.status(&job_id, offset).await;
            self.apply(result).await;
        }
        &self.state
    }

    async fn apply(&mut self, result: Result<OutputSlice, ClientError>) {
        let PollState::Polling { job_id, .. } = self.state else {
            return;
        };

        let slice = match result {
            Ok(slice) => slice,
            Err(e) if e.is_retryable() => {
                warn!(%job_id, error = %e, "Status poll failed; retrying");
                self.timer.schedule(self.settings.interval);
                return;
            }
            Err(e) => {
                warn!(%job_id, error = %e, "Status poll failed permanently");
                self.timer.clear();
                self.log.notice(&format!("✗ {e}\n"));
                self.state = PollState::Terminal(PollOutcome::Failed(e.to_string()));
                return;
            }
        };

        if !slice.data.is_empty() {
            self.log.append(&slice.data);
        }
        // Always resume from the server's count, never a local tally.
        self.state = PollState::Polling {
            job_id,
            offset: slice.full_length,
        };

        if !slice.status.is_terminal() {
            self.timer.schedule(self.settings.interval);
            return;
        }

        self.timer.clear();
        self.log.notice(&result_summary(&slice));
        let outcome = PollOutcome::Finished {
            status: slice.status,
            exit_code: slice.exit_code,
            duration: slice.duration,
            failure: slice.failure,
        };
        if outcome.is_success() && self.request.coverage {
            self.fetch_coverage().await;
        }
        debug!(%job_id, status = %slice.status, "Test run finished");
        self.state = PollState::Terminal(outcome);
    }

    async fn fetch_coverage(&mut self) {
        match self.api.coverage_summary().await {
            Ok(summary) => {
                if let Some(line) = coverage_line(&summary) {
                    self.log.notice(&line);
                }
                self.coverage = Some(summary);
            }
            Err(e) => {
                warn!(error = %e, "Coverage summary unavailable");
                self.log.notice(&format!("Coverage summary unavailable: {e}\n"));
            }
        }
    }

    /// Stop watching. Only valid while polling; returns whether it applied.
    pub async fn stop(&mut self) -> bool {
        let PollState::Polling { job_id, .. } = self.state else {
            return false;
        };
        self.timer.clear();
        self.log.append(STOPPED_MARKER);
        self.state = PollState::Terminal(PollOutcome::Stopped);
        info!(%job_id, "Stopped polling");

        if self.settings.cancel_on_stop {
            if let Err(e) = self.api.cancel(&job_id).await {
                warn!(%job_id, error = %e, "Failed to cancel job after stop");
            }
        }
        true
    }

    fn time_out(&mut self) {
        let PollState::Polling { job_id, .. } = self.state else {
            return;
        };
        self.timer.clear();
        self.log.append(TIMEOUT_MARKER);
        warn!(%job_id, timeout = ?self.settings.overall_timeout, "Gave up waiting for test run");
        self.state = PollState::Terminal(PollOutcome::TimedOut);
    }

    /// Drive ticks until terminal, racing each wait and each in-flight
    /// request against `stop` and the overall deadline.
    pub async fn run(&mut self, stop: CancellationToken) -> PollOutcome {
        loop {
            let (job_id, offset) = match &self.state {
                PollState::Polling { job_id, offset } => (*job_id, *offset),
                PollState::Terminal(outcome) => return outcome.clone(),
                PollState::Idle => {
                    return PollOutcome::Failed("poll consumer was never started".to_string());
                }
            };
            let deadline = self.deadline.unwrap_or_else(Instant::now);

            let wake = {
                let tick = self.timer.fired();
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => Wake::Stop,
                    _ = sleep_until(deadline) => Wake::Deadline,
                    _ = tick => Wake::Tick,
                }
            };

            match wake {
                Wake::Stop => {
                    self.stop().await;
                }
                Wake::Deadline => self.time_out(),
                Wake::Tick => {
                    self.timer.clear();
                    let inflight = {
                        let request = self.api.status(&job_id, offset);
                        tokio::select! {
                            biased;
                            _ = stop.cancelled() => Inflight::Stop,
                            _ = sleep_until(deadline) => Inflight::Deadline,
                            result = request => Inflight::Done(result),
                        }
                    };
                    match inflight {
                        Inflight::Stop => {
                            self.stop().await;
                        }
                        Inflight::Deadline => self.time_out(),
                        Inflight::Done(result) => self.apply(result).await,
                    }
                }
            }
        }
    }
}

fn result_summary(slice: &OutputSlice) -> String {
    let took = slice
        .duration
        .map(|d| format!(" in {d:.1}s"))
        .unwrap_or_default();
    match (slice.status, slice.failure) {
        (JobStatus::Completed, _) => format!("\n✓ Tests passed{took}\n"),
        (_, Some(FailureKind::TimedOut)) => format!("\n✗ Test run timed out{took}\n"),
        (JobStatus::Cancelled, _) | (_, Some(FailureKind::Cancelled)) => {
            format!("\n✗ Test run cancelled{took}\n")
        }
        (_, Some(FailureKind::SpawnFailed)) => "\n✗ Test command could not be started\n".to_string(),
        _ => match slice.exit_code {
            Some(code) => format!("\n✗ Tests failed with exit code {code}{took}\n"),
            None => format!("\n✗ Tests failed{took}\n"),
        },
    }
}

/// One-line rendering of an istanbul-style `coverage-summary.json`.
fn coverage_line(summary: &serde_json::Value) -> Option<String> {
    let total = summary.get("total")?;
    let pct = |key: &str| total.get(key)?.get("pct")?.as_f64();
    let parts: Vec<String> = ["lines", "statements", "functions", "branches"]
        .iter()
        .filter_map(|key| pct(key).map(|p| format!("{key} {p:.1}%")))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(format!("Coverage: {}\n", parts.join(", ")))
    }
}
