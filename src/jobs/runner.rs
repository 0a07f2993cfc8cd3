//! Out-of-process command execution.
//!
//! `CommandRunner::start` registers a job and returns its id at once; the
//! command itself runs on a dedicated tokio task that owns the job's
//! [`JobWriter`] until the single terminal transition.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use devjobs_common::markers::{STOPPED_MARKER, TIMEOUT_MARKER};
use devjobs_common::{FailureKind, JobId, JobStatus};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::{JobRegistry, JobWriter};
use crate::errors::JobError;
use crate::util::Utf8Decoder;

const READ_CHUNK_BYTES: usize = 8192;

/// What to run for one job.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Human-readable name shown in job listings.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Wall-clock ceiling, enforced server-side.
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let program = program.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let label = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            label,
            program,
            args,
            cwd: None,
            timeout: Duration::from_secs(600),
            env: Vec::new(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Time between SIGTERM and SIGKILL when terminating a process group.
    pub kill_grace: Duration,
    /// How long to keep collecting output after the process has exited.
    pub drain_grace: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(2),
            drain_grace: Duration::from_millis(500),
        }
    }
}

/// Spawns and supervises one OS process per job.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    registry: Arc<JobRegistry>,
    settings: RunnerSettings,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

impl CommandRunner {
    pub fn new(registry: Arc<JobRegistry>, settings: RunnerSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Register a job for `spec` and launch it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, spec: CommandSpec) -> Result<JobId, JobError> {
        let (id, writer) = self.registry.create(spec.label.clone())?;
        let settings = self.settings.clone();
        tokio::spawn(run_job(writer, spec, settings));
        Ok(id)
    }

    /// Cancel every unfinished job; used on server shutdown.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "Cancelled running jobs on shutdown");
        }
        cancelled
    }
}

async fn run_job(writer: JobWriter, spec: CommandSpec, settings: RunnerSettings) {
    let job_id = writer.id();
    let cancel = writer.cancel_token();

    if cancel.is_cancelled() {
        writer.append(STOPPED_MARKER);
        writer.finish(JobStatus::Cancelled, None, Some(FailureKind::Cancelled));
        return;
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    // Own process group so termination reaches grandchildren too.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = JobError::Spawn {
                program: spec.program.clone(),
                source,
            };
            warn!(job_id = %job_id, error = %err, "Failed to start job");
            writer.append(&format!("{}\n", err));
            writer.finish(JobStatus::Error, None, Some(FailureKind::SpawnFailed));
            return;
        }
    };

    writer.mark_running();
    info!(job_id = %job_id, label = %spec.label, pid = ?child.id(), timeout_secs = spec.timeout.as_secs(), "Job started");

    let (tx, mut rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);
    let mut streams_open = true;

    let outcome = loop {
        tokio::select! {
            chunk = rx.recv(), if streams_open => match chunk {
                Some(text) => writer.append(&text),
                None => streams_open = false,
            },
            status = child.wait() => break Outcome::Exited(status),
            _ = cancel.cancelled() => break Outcome::Cancelled,
            _ = &mut deadline => break Outcome::TimedOut,
        }
    };

    match outcome {
        Outcome::Exited(result) => {
            drain(&mut rx, &writer, settings.drain_grace).await;
            match result {
                Ok(status) => match status.code() {
                    Some(0) => {
                        writer.finish(JobStatus::Completed, Some(0), None);
                    }
                    Some(code) => {
                        writer.finish(JobStatus::Error, Some(code), Some(FailureKind::NonZeroExit));
                    }
                    None => {
                        writer.append(&format!("\n[process terminated: {}]\n", status));
                        writer.finish(JobStatus::Error, None, Some(FailureKind::NonZeroExit));
                    }
                },
                Err(e) => {
                    writer.append(&format!("\n[failed to wait for process: {}]\n", e));
                    writer.finish(JobStatus::Error, None, Some(FailureKind::RunnerLost));
                }
            }
        }
        Outcome::Cancelled => {
            terminate(&mut child, settings.kill_grace).await;
            drain(&mut rx, &writer, settings.drain_grace).await;
            writer.append(STOPPED_MARKER);
            writer.finish(JobStatus::Cancelled, None, Some(FailureKind::Cancelled));
        }
        Outcome::TimedOut => {
            terminate(&mut child, settings.kill_grace).await;
            drain(&mut rx, &writer, settings.drain_grace).await;
            writer.append(TIMEOUT_MARKER);
            writer.finish(JobStatus::Error, None, Some(FailureKind::TimedOut));
        }
    }

    info!(job_id = %job_id, "Job finished");
}

/// Forward one pipe to the writer loop as decoded text chunks.
async fn pump<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && tx.send(text).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(rest).await;
    }
}

/// Collect output still in flight, bounded by `grace` in total.
async fn drain(rx: &mut mpsc::Receiver<String>, writer: &JobWriter, grace: Duration) {
    let until = Instant::now() + grace;
    while let Ok(Some(text)) = tokio::time::timeout_at(until, rx.recv()).await {
        writer.append(&text);
    }
}

/// Terminate the child's process group: SIGTERM, then SIGKILL after `grace`.
#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);

    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(grace) => {
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill job process");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jobs::registry::RetentionPolicy;
    use devjobs_common::JobSummary;

    fn runner() -> CommandRunner {
        let registry = Arc::new(JobRegistry::new(RetentionPolicy::default()));
        CommandRunner::new(
            registry,
            RunnerSettings {
                kill_grace: Duration::from_millis(200),
                drain_grace: Duration::from_millis(200),
            },
        )
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script]).timeout(Duration::from_secs(10))
    }

    async fn wait_terminal(runner: &CommandRunner, id: &JobId) -> JobSummary {
        let cell = runner.registry().get(id).unwrap();
        let mut rx = cell.subscribe();
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                rx.borrow_and_update();
                let summary = cell.summary();
                if summary.status.is_terminal() {
                    return summary;
                }
                if rx.changed().await.is_err() {
                    return cell.summary();
                }
            }
        })
        .await
        .expect("job did not finish in time")
    }

    #[tokio::test]
    async fn test_echo_completes_with_exit_zero() {
        let runner = runner();
        let id = runner.start(sh("echo hello; exit 0")).unwrap();
        let summary = wait_terminal(&runner, &id).await;

        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.exit_code, Some(0));
        assert_eq!(summary.failure, None);
        let slice = runner.registry().read(&id, 0).unwrap();
        assert_eq!(slice.data, "hello\n");
        assert_eq!(slice.full_length, 6);
    }

    #[tokio::test]
    async fn test_start_returns_before_command_finishes() {
        let runner = runner();
        let started = std::time::Instant::now();
        let id = runner.start(sh("sleep 2")).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!runner.registry().summary(&id).unwrap().status.is_terminal());
        runner.registry().cancel(&id).unwrap();
        wait_terminal(&runner, &id).await;
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error_with_code() {
        let runner = runner();
        let id = runner.start(sh("echo oops >&2; exit 3")).unwrap();
        let summary = wait_terminal(&runner, &id).await;

        assert_eq!(summary.status, JobStatus::Error);
        assert_eq!(summary.exit_code, Some(3));
        assert_eq!(summary.failure, Some(FailureKind::NonZeroExit));
        assert!(runner.registry().read(&id, 0).unwrap().data.contains("oops"));
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr_in_order_per_stream() {
        let runner = runner();
        let id = runner
            .start(sh("printf 'a\\nb\\n'; printf 'err\\n' >&2; printf 'c\\n'"))
            .unwrap();
        wait_terminal(&runner, &id).await;

        let data = runner.registry().read(&id, 0).unwrap().data;
        assert!(data.contains("err\n"));
        let a = data.find("a\n").unwrap();
        let b = data.find("b\n").unwrap();
        let c = data.find("c\n").unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_multibyte_output_survives_chunking() {
        let runner = runner();
        let id = runner.start(sh("printf 'caf\\303\\251 \\342\\234\\223\\n'")).unwrap();
        wait_terminal(&runner, &id).await;
        assert_eq!(runner.registry().read(&id, 0).unwrap().data, "café ✓\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process_and_marks_error() {
        let runner = runner();
        let spec = sh("echo begin; sleep 30").timeout(Duration::from_millis(300));
        let id = runner.start(spec).unwrap();
        let summary = wait_terminal(&runner, &id).await;

        assert_eq!(summary.status, JobStatus::Error);
        assert_eq!(summary.exit_code, None);
        assert_eq!(summary.failure, Some(FailureKind::TimedOut));
        let data = runner.registry().read(&id, 0).unwrap().data;
        assert!(data.starts_with("begin\n"));
        assert!(data.ends_with(TIMEOUT_MARKER));
    }

    #[tokio::test]
    async fn test_cancel_mid_run() {
        let runner = runner();
        let id = runner.start(sh("echo working; sleep 30")).unwrap();

        // Wait until the process is actually producing output.
        let cell = runner.registry().get(&id).unwrap();
        let mut rx = cell.subscribe();
        while cell.read(0).unwrap().data.is_empty() {
            rx.changed().await.unwrap();
        }

        runner.registry().cancel(&id).unwrap();
        let summary = wait_terminal(&runner, &id).await;
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.exit_code, None);
        assert!(summary.cancel_requested);
        assert!(cell.read(0).unwrap().data.ends_with(STOPPED_MARKER));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let runner = runner();
        let id = runner
            .start(CommandSpec::new("/definitely/not/a/program", Vec::<String>::new()))
            .unwrap();
        let summary = wait_terminal(&runner, &id).await;

        assert_eq!(summary.status, JobStatus::Error);
        assert_eq!(summary.failure, Some(FailureKind::SpawnFailed));
        assert!(runner.registry().read(&id, 0).unwrap().data.contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_background_child_does_not_keep_job_running() {
        let runner = runner();
        // The grandchild inherits the pipes but the shell exits immediately.
        let id = runner.start(sh("sleep 3 & echo parent done")).unwrap();
        let summary = wait_terminal(&runner, &id).await;
        assert_eq!(summary.status, JobStatus::Completed);
        runner.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_jobs() {
        let runner = runner();
        let a = runner.start(sh("sleep 30")).unwrap();
        let b = runner.start(sh("sleep 30")).unwrap();
        assert_eq!(runner.shutdown(), 2);
        assert_eq!(wait_terminal(&runner, &a).await.status, JobStatus::Cancelled);
        assert_eq!(wait_terminal(&runner, &b).await.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_command_spec_label_defaults_to_command_line() {
        let spec = CommandSpec::new("npm", ["run", "build"]).cwd("frontend");
        assert_eq!(spec.label, "npm run build");
        assert_eq!(spec.cwd, Some(PathBuf::from("frontend")));
        assert_eq!(spec.clone().label("frontend build").label, "frontend build");
    }
}
