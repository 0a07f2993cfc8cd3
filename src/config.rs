//! Layered configuration for devjobs.
//!
//! Settings come from `devjobs.toml` (file → environment → CLI). The file is
//! looked up in `.devjobs/devjobs.toml` under the working directory, then in
//! the user config directory.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 4100
//! dev_mode = false
//! sweep_interval_secs = 60
//!
//! [auth]
//! token = "change-me"
//!
//! [jobs]
//! default_timeout_secs = 600
//! retention_secs = 3600
//! max_finished_jobs = 100
//! max_running_jobs = 8
//! max_output_bytes = 33554432
//! kill_grace_ms = 2000
//!
//! [builds.rebuild]
//! program = "npm"
//! args = ["run", "build"]
//!
//! [builds.targets.frontend]
//! program = "npm"
//! args = ["run", "build"]
//! cwd = "frontend"
//!
//! [tests]
//! program = "npm"
//! args = ["test", "--"]
//! coverage_args = ["--coverage"]
//! pattern_args = ["--testNamePattern", "{pattern}"]
//! cwd = "backend"
//! coverage_summary = "backend/coverage/coverage-summary.json"
//!
//! [client]
//! server_url = "http://127.0.0.1:4100"
//! poll_interval_ms = 1000
//! overall_timeout_secs = 600
//! log_cap_chars = 50000
//! cancel_on_stop = false
//! ```

use anyhow::{Context, Result};
use devjobs_common::TestRunRequest;
use devjobs_common::markers::TRUNCATION_MARKER;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::log::TruncatedLog;
use crate::client::poll::PollSettings;
use crate::errors::JobError;
use crate::jobs::{CommandSpec, RetentionPolicy, RunnerSettings};

pub const CONFIG_FILE_NAME: &str = "devjobs.toml";
pub const PROJECT_CONFIG_DIR: &str = ".devjobs";

pub const TOKEN_ENV: &str = "DEVJOBS_TOKEN";
pub const PORT_ENV: &str = "DEVJOBS_PORT";
pub const SERVER_URL_ENV: &str = "DEVJOBS_SERVER_URL";

const PATTERN_PLACEHOLDER: &str = "{pattern}";

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables permissive CORS for local frontend development.
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4100
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Bearer token accepted on every `/jobs` route.
    #[serde(default)]
    pub token: Option<String>,
}

/// Execution and retention limits for the job registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSection {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_max_finished_jobs")]
    pub max_finished_jobs: usize,
    /// 0 disables the limit.
    #[serde(default = "default_max_running_jobs")]
    pub max_running_jobs: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_max_finished_jobs() -> usize {
    100
}

fn default_max_running_jobs() -> usize {
    8
}

fn default_max_output_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_kill_grace_ms() -> u64 {
    2000
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            retention_secs: default_retention_secs(),
            max_finished_jobs: default_max_finished_jobs(),
            max_running_jobs: default_max_running_jobs(),
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// One configured command: an executable plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Relative paths resolve against the server's working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Overrides `jobs.default_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandConfig {
    fn npm_build(cwd: Option<&str>) -> Self {
        Self {
            program: "npm".to_string(),
            args: vec!["run".to_string(), "build".to_string()],
            cwd: cwd.map(PathBuf::from),
            timeout_secs: None,
            env: HashMap::new(),
        }
    }

    fn to_spec(&self, label: String, root: &Path, default_timeout: Duration) -> CommandSpec {
        let mut spec = CommandSpec::new(self.program.clone(), self.args.clone())
            .label(label)
            .timeout(
                self.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout),
            );
        if let Some(cwd) = &self.cwd {
            spec = spec.cwd(root.join(cwd));
        }
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        spec.env = env;
        spec
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildsSection {
    #[serde(default = "default_rebuild")]
    pub rebuild: CommandConfig,
    #[serde(default = "default_targets")]
    pub targets: BTreeMap<String, CommandConfig>,
}

fn default_rebuild() -> CommandConfig {
    CommandConfig::npm_build(None)
}

fn default_targets() -> BTreeMap<String, CommandConfig> {
    let mut targets = BTreeMap::new();
    targets.insert(
        "frontend".to_string(),
        CommandConfig::npm_build(Some("frontend")),
    );
    targets.insert(
        "backend".to_string(),
        CommandConfig::npm_build(Some("backend")),
    );
    targets
}

impl Default for BuildsSection {
    fn default() -> Self {
        Self {
            rebuild: default_rebuild(),
            targets: default_targets(),
        }
    }
}

/// Test-run command. `pattern_args` are appended only when a pattern is
/// given, with `{pattern}` substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsSection {
    #[serde(default = "default_test_program")]
    pub program: String,
    #[serde(default = "default_test_args")]
    pub args: Vec<String>,
    #[serde(default = "default_coverage_args")]
    pub coverage_args: Vec<String>,
    #[serde(default = "default_pattern_args")]
    pub pattern_args: Vec<String>,
    #[serde(default = "default_test_cwd")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// JSON file served by `GET /jobs/tests/coverage`.
    #[serde(default = "default_coverage_summary")]
    pub coverage_summary: PathBuf,
}

fn default_test_program() -> String {
    "npm".to_string()
}

fn default_test_args() -> Vec<String> {
    vec!["test".to_string(), "--".to_string()]
}

fn default_coverage_args() -> Vec<String> {
    vec!["--coverage".to_string()]
}

fn default_pattern_args() -> Vec<String> {
    vec![
        "--testNamePattern".to_string(),
        PATTERN_PLACEHOLDER.to_string(),
    ]
}

fn default_test_cwd() -> Option<PathBuf> {
    Some(PathBuf::from("backend"))
}

fn default_coverage_summary() -> PathBuf {
    PathBuf::from("backend/coverage/coverage-summary.json")
}

impl Default for TestsSection {
    fn default() -> Self {
        Self {
            program: default_test_program(),
            args: default_test_args(),
            coverage_args: default_coverage_args(),
            pattern_args: default_pattern_args(),
            cwd: default_test_cwd(),
            timeout_secs: None,
            coverage_summary: default_coverage_summary(),
        }
    }
}

/// Settings for the `build`, `test` and `status` client commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Defaults to the address in `[server]`.
    #[serde(default)]
    pub server_url: Option<String>,
    /// Falls back to `[auth] token`.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,
    #[serde(default = "default_log_cap_chars")]
    pub log_cap_chars: usize,
    /// Also cancel the server-side job when the user stops polling.
    #[serde(default)]
    pub cancel_on_stop: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_overall_timeout_secs() -> u64 {
    600
}

fn default_log_cap_chars() -> usize {
    50_000
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            poll_interval_ms: default_poll_interval_ms(),
            initial_delay_ms: default_poll_interval_ms(),
            overall_timeout_secs: default_overall_timeout_secs(),
            log_cap_chars: default_log_cap_chars(),
            cancel_on_stop: false,
        }
    }
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub token: Option<String>,
    pub server_url: Option<String>,
    pub dev_mode: bool,
}

/// Root of `devjobs.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevJobsToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub builds: BuildsSection,
    #[serde(default)]
    pub tests: TestsSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(skip)]
    pub overrides: CliOverrides,
}

impl DevJobsToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse devjobs.toml")
    }

    /// Load from `explicit` if given, else the first existing default
    /// location, else built-in defaults. An explicit path must exist.
    pub fn load_or_default(explicit: Option<&Path>, project_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_locations(project_dir)
            .into_iter()
            .find(|p| p.exists())
        {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Candidate config paths in lookup order.
    pub fn default_locations(project_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![project_dir.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("devjobs").join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize devjobs.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Server token: CLI, environment, then `[auth] token`.
    pub fn server_token(&self) -> Option<String> {
        non_empty(self.overrides.token.clone())
            .or_else(|| non_empty_env(TOKEN_ENV))
            .or_else(|| non_empty(self.auth.token.clone()))
    }

    /// Client token: CLI, environment, `[client] token`, then `[auth] token`.
    pub fn client_token(&self) -> Option<String> {
        non_empty(self.overrides.token.clone())
            .or_else(|| non_empty_env(TOKEN_ENV))
            .or_else(|| non_empty(self.client.token.clone()))
            .or_else(|| non_empty(self.auth.token.clone()))
    }

    /// Listener port: CLI, then `DEVJOBS_PORT` when it parses, then file.
    pub fn port(&self) -> u16 {
        self.overrides
            .port
            .or_else(|| non_empty_env(PORT_ENV).and_then(|p| p.parse().ok()))
            .unwrap_or(self.server.port)
    }

    pub fn dev_mode(&self) -> bool {
        self.overrides.dev_mode || self.server.dev_mode
    }

    pub fn server_url(&self) -> String {
        non_empty(self.overrides.server_url.clone())
            .or_else(|| non_empty_env(SERVER_URL_ENV))
            .or_else(|| non_empty(self.client.server_url.clone()))
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.port()))
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention: Duration::from_secs(self.jobs.retention_secs),
            max_finished_jobs: self.jobs.max_finished_jobs,
            max_running_jobs: self.jobs.max_running_jobs,
            max_output_bytes: self.jobs.max_output_bytes,
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            kill_grace: Duration::from_millis(self.jobs.kill_grace_ms),
            ..RunnerSettings::default()
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.client.poll_interval_ms),
            initial_delay: Duration::from_millis(self.client.initial_delay_ms),
            overall_timeout: Duration::from_secs(self.client.overall_timeout_secs),
            cancel_on_stop: self.client.cancel_on_stop,
        }
    }

    /// Retained copy of a job's client-side log, capped at `log_cap_chars`.
    pub fn client_log(&self) -> TruncatedLog {
        TruncatedLog::new(self.client.log_cap_chars)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.jobs.default_timeout_secs)
    }

    /// Command for `POST /jobs/build/stream {target}`.
    pub fn build_spec(&self, target: &str, root: &Path) -> Result<CommandSpec, JobError> {
        let cmd = self
            .builds
            .targets
            .get(target)
            .ok_or_else(|| JobError::UnknownTarget {
                target: target.to_string(),
            })?;
        Ok(cmd.to_spec(format!("build {target}"), root, self.default_timeout()))
    }

    pub fn rebuild_spec(&self, root: &Path) -> CommandSpec {
        self.builds
            .rebuild
            .to_spec("rebuild".to_string(), root, self.default_timeout())
    }

    /// Command for `POST /jobs/tests/run`.
    ///
    /// The pattern is passed as a single argument, never through a shell.
    pub fn test_spec(&self, request: &TestRunRequest, root: &Path) -> CommandSpec {
        let tests = &self.tests;
        let mut args = tests.args.clone();
        if request.coverage {
            args.extend(tests.coverage_args.iter().cloned());
        }
        let pattern = request.pattern.trim();
        if !pattern.is_empty() {
            args.extend(
                tests
                    .pattern_args
                    .iter()
                    .map(|a| a.replace(PATTERN_PLACEHOLDER, pattern)),
            );
        }

        let label = if pattern.is_empty() {
            "tests".to_string()
        } else {
            format!("tests ({pattern})")
        };
        let mut spec = CommandSpec::new(tests.program.clone(), args)
            .label(label)
            .timeout(
                tests
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.default_timeout()),
            );
        if let Some(cwd) = &tests.cwd {
            spec = spec.cwd(root.join(cwd));
        }
        spec
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server_token().is_none() {
            warnings.push(format!(
                "No auth token configured; set [auth] token or {TOKEN_ENV} before running `serve`"
            ));
        }
        if self.jobs.default_timeout_secs == 0 {
            warnings.push("jobs.default_timeout_secs is 0; every job will time out".to_string());
        }
        if self.jobs.max_output_bytes == 0 {
            warnings.push("jobs.max_output_bytes is 0; job output will be discarded".to_string());
        }
        if self.server.sweep_interval_secs == 0 {
            warnings.push("server.sweep_interval_secs is 0; using 1 second".to_string());
        }
        for (name, cmd) in &self.builds.targets {
            if cmd.program.trim().is_empty() {
                warnings.push(format!("builds.targets.{name} has an empty program"));
            }
        }
        if self.builds.rebuild.program.trim().is_empty() {
            warnings.push("builds.rebuild has an empty program".to_string());
        }
        if self.tests.program.trim().is_empty() {
            warnings.push("tests.program is empty".to_string());
        }
        if !self.tests.pattern_args.is_empty()
            && !self
                .tests
                .pattern_args
                .iter()
                .any(|a| a.contains(PATTERN_PLACEHOLDER))
        {
            warnings.push(format!(
                "tests.pattern_args does not contain {PATTERN_PLACEHOLDER}; the pattern will be ignored"
            ));
        }
        if self.client.poll_interval_ms == 0 {
            warnings.push("client.poll_interval_ms is 0; polls will run back to back".to_string());
        }
        if self.client.log_cap_chars < TRUNCATION_MARKER.chars().count() {
            warnings.push("client.log_cap_chars is smaller than the truncation marker".to_string());
        }
        if let Some(url) = non_empty(self.client.server_url.clone()) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                warnings.push(format!("client.server_url '{url}' is not an http(s) URL"));
            }
        }

        warnings
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_empty_env(key: &str) -> Option<String> {
    non_empty(std::env::var(key).ok())
}
