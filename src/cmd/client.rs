//! Client commands that talk to a running server: `devjobs build`,
//! `rebuild`, `test`, `status`, `cancel` and `jobs`.

use anyhow::{Context, Result, bail};
use devjobs::client::{
    ConsoleSink, JobApi, JobsClient, LogSink, PollConsumer, PollOutcome, StreamConsumer,
    TruncatedLog,
};
use devjobs::common::markers::STOPPED_MARKER;
use devjobs::common::{JobId, JobSummary, TestRunRequest};
use devjobs::config::DevJobsToml;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn connect(config: &DevJobsToml) -> Result<JobsClient> {
    let token = config
        .client_token()
        .context("No auth token; pass --token, set DEVJOBS_TOKEN or [client] token")?;
    let url = config.server_url();
    debug!(%url, "Connecting to devjobs server");
    Ok(JobsClient::new(&url, token)?)
}

fn parse_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("'{}' is not a valid job id", raw))
}

/// Write the retained log to `path`, when one was asked for.
fn save_log(log: &TruncatedLog, path: Option<&Path>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    std::fs::write(path, log.text())
        .with_context(|| format!("Failed to write log to {}", path.display()))?;
    debug!(
        path = %path.display(),
        chars = log.len_chars(),
        truncated = log.is_truncated(),
        "Saved job log"
    );
    Ok(())
}

/// Stream a build (or the full rebuild when `target` is `None`) to stdout.
pub async fn cmd_build(
    config: &DevJobsToml,
    target: Option<&str>,
    log_path: Option<&Path>,
) -> Result<()> {
    let client = connect(config)?;
    let response = match target {
        Some(target) => client.stream_build(target).await?,
        None => client.stream_rebuild().await?,
    };

    let mut consumer = StreamConsumer::new((ConsoleSink::new(), config.client_log()));
    let outcome = tokio::select! {
        outcome = consumer.consume(response.bytes_stream()) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let job_id = consumer.job_id();
    let mut log = consumer.into_log();

    let Some(outcome) = outcome else {
        log.append(STOPPED_MARKER);
        save_log(&log.1, log_path)?;
        if config.client.cancel_on_stop {
            if let Some(id) = job_id {
                if let Err(e) = client.cancel(&id).await {
                    warn!(job_id = %id, error = %e, "Failed to cancel build after stop");
                }
            }
        }
        bail!("Stopped by user");
    };
    save_log(&log.1, log_path)?;

    if outcome.skipped_frames > 0 {
        warn!(skipped = outcome.skipped_frames, "Some stream frames could not be decoded");
    }
    if !outcome.success {
        match outcome.message {
            Some(message) => bail!("Build failed: {}", message),
            None => bail!("Build failed"),
        }
    }
    Ok(())
}

/// Submit a test run and poll it until it reaches a terminal state.
pub async fn cmd_test(
    config: &DevJobsToml,
    pattern: String,
    coverage: bool,
    log_path: Option<&Path>,
) -> Result<()> {
    let client = connect(config)?;
    let sink = (ConsoleSink::new(), config.client_log());
    let mut consumer = PollConsumer::new(client, sink, config.poll_settings());
    consumer
        .start(TestRunRequest { pattern, coverage })
        .await
        .context("Failed to start test run")?;

    let stop = CancellationToken::new();
    let on_ctrl_c = stop.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });
    let outcome = consumer.run(stop).await;
    watcher.abort();
    let (_, retained) = consumer.into_log();
    save_log(&retained, log_path)?;

    match outcome {
        outcome if outcome.is_success() => Ok(()),
        PollOutcome::Finished { .. } => bail!("Test run failed"),
        PollOutcome::Stopped => bail!("Stopped by user"),
        PollOutcome::TimedOut => bail!("Gave up waiting for the test run"),
        PollOutcome::Failed(message) => bail!("{}", message),
    }
}

/// Print one status read and the output from `offset`.
pub async fn cmd_status(config: &DevJobsToml, job_id: &str, offset: usize) -> Result<()> {
    let client = connect(config)?;
    let id = parse_id(job_id)?;
    let slice = client.status(&id, offset).await?;

    let mut sink = ConsoleSink::new();
    sink.append(&slice.data);
    if !slice.data.is_empty() && !slice.data.ends_with('\n') {
        sink.append("\n");
    }
    let mut line = format!("status: {}  fullLength: {}", slice.status, slice.full_length);
    if let Some(code) = slice.exit_code {
        line.push_str(&format!("  exit code: {code}"));
    }
    if let Some(failure) = slice.failure {
        line.push_str(&format!("  failure: {}", failure.as_str()));
    }
    if let Some(duration) = slice.duration {
        line.push_str(&format!("  duration: {duration:.1}s"));
    }
    sink.notice(&format!("{line}\n"));
    Ok(())
}

pub async fn cmd_cancel(config: &DevJobsToml, job_id: &str) -> Result<()> {
    let client = connect(config)?;
    let id = parse_id(job_id)?;
    let summary = client.cancel(&id).await?;
    if summary.status.is_terminal() && !summary.cancel_requested {
        println!("Job {} already finished ({})", summary.id, summary.status);
    } else {
        println!("Cancellation requested for job {}", summary.id);
    }
    Ok(())
}

pub async fn cmd_jobs(config: &DevJobsToml) -> Result<()> {
    let client = connect(config)?;
    let jobs = client.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!("{:<36}  {:<10}  {:>10}  LABEL", "ID", "STATUS", "OUTPUT");
    for job in &jobs {
        println!("{}", job_row(job));
    }
    Ok(())
}

fn job_row(job: &JobSummary) -> String {
    format!(
        "{:<36}  {:<10}  {:>10}  {}",
        job.id.to_string(),
        job.status.as_str(),
        job.output_length,
        job.label
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devjobs::common::JobStatus;

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid").is_err());
        let id = JobId::new();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_job_row_contains_fields() {
        let job = JobSummary {
            id: JobId::new(),
            label: "build frontend".to_string(),
            status: JobStatus::Running,
            exit_code: None,
            failure: None,
            output_length: 1234,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            duration: None,
        };
        let row = job_row(&job);
        assert!(row.starts_with(&job.id.to_string()));
        assert!(row.contains("running"));
        assert!(row.contains("1234"));
        assert!(row.ends_with("build frontend"));
    }

    #[test]
    fn test_save_log_writes_retained_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");
        let mut log = TruncatedLog::new(1000);
        log.append("compiled\n");

        save_log(&log, None).unwrap();
        assert!(!path.exists());
        save_log(&log, Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "compiled\n");
    }

    #[test]
    fn test_connect_requires_token() {
        let mut config = DevJobsToml::default();
        config.overrides.server_url = Some("http://127.0.0.1:1".to_string());
        if config.client_token().is_none() {
            assert!(connect(&config).is_err());
        }
        config.overrides.token = Some("t".to_string());
        assert!(connect(&config).is_ok());
    }
}
