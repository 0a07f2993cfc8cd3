//! In-memory job table.
//!
//! Every job lives in its own [`JobCell`] behind its own lock, so readers of one
//! job never contend with the writer of another. The map itself is a sharded
//! `DashMap`; there is no lock that serialises all jobs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use devjobs_common::markers::{OUTPUT_LIMIT_MARKER, RUNNER_LOST_MARKER};
use devjobs_common::{FailureKind, JobId, JobStatus, JobSummary, OutputSlice};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::JobError;

/// Bounds on how many jobs, and how much output, the registry keeps.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Finished jobs older than this are evicted.
    pub retention: Duration,
    /// At most this many finished jobs are kept; oldest go first.
    pub max_finished_jobs: usize,
    /// Refuse new jobs while this many are queued or running (0 = unlimited).
    pub max_running_jobs: usize,
    /// Output beyond this many bytes per job is discarded.
    pub max_output_bytes: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
            max_finished_jobs: 100,
            max_running_jobs: 8,
            max_output_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct JobState {
    label: String,
    status: JobStatus,
    output: String,
    output_capped: bool,
    exit_code: Option<i32>,
    failure: Option<FailureKind>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

impl JobState {
    fn duration(&self) -> Option<f64> {
        let finished = self.finished_at?;
        let started = self.started_at.unwrap_or(self.created_at);
        Some((finished - started).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// One tracked job: its state, its cancel signal and its change feed.
#[derive(Debug)]
pub struct JobCell {
    id: JobId,
    state: RwLock<JobState>,
    cancel: CancellationToken,
    changes: watch::Receiver<u64>,
}

impl JobCell {
    fn read_state(&self) -> RwLockReadGuard<'_, JobState> {
        // Writers only push whole strings under the lock, so a poisoned
        // guard still holds consistent state.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, JobState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.read_state().status
    }

    pub fn label(&self) -> String {
        self.read_state().label.clone()
    }

    pub fn summary(&self) -> JobSummary {
        let state = self.read_state();
        JobSummary {
            id: self.id,
            label: state.label.clone(),
            status: state.status,
            exit_code: state.exit_code,
            failure: state.failure,
            output_length: state.output.len(),
            created_at: state.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            cancel_requested: state.cancel_requested,
            duration: state.duration(),
        }
    }

    /// Output produced since `offset`, plus the authoritative length.
    ///
    /// An offset past the end yields an empty slice so the caller can
    /// resynchronise to `full_length`.
    pub fn read(&self, offset: usize) -> Result<OutputSlice, JobError> {
        let state = self.read_state();
        let full_length = state.output.len();
        let data = if offset >= full_length {
            String::new()
        } else if state.output.is_char_boundary(offset) {
            state.output[offset..].to_string()
        } else {
            return Err(JobError::InvalidOffset { offset });
        };

        let terminal = state.status.is_terminal();
        Ok(OutputSlice {
            data,
            full_length,
            status: state.status,
            exit_code: if terminal { state.exit_code } else { None },
            duration: if terminal { state.duration() } else { None },
            failure: state.failure,
        })
    }

    /// Receiver that ticks whenever output is appended or the status changes.
    /// Errors from `changed()` mean the writer is gone.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Flag the job for cancellation. Has no effect once it is terminal.
    pub fn request_cancel(&self) -> JobSummary {
        {
            let mut state = self.write_state();
            if !state.status.is_terminal() {
                state.cancel_requested = true;
                self.cancel.cancel();
            }
        }
        self.summary()
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        let state = self.read_state();
        if state.status.is_terminal() {
            state.finished_at
        } else {
            None
        }
    }
}

/// The single writer for one job.
///
/// Dropping a writer that never reached a terminal status marks the job as
/// failed with [`FailureKind::RunnerLost`].
#[derive(Debug)]
pub struct JobWriter {
    cell: Arc<JobCell>,
    tx: watch::Sender<u64>,
    max_output_bytes: usize,
    /// Registry count of queued and running jobs; released on finish.
    live: Arc<AtomicUsize>,
}

impl JobWriter {
    pub fn id(&self) -> JobId {
        self.cell.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cell.cancel_token()
    }

    fn notify(&self) {
        self.tx.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub fn mark_running(&self) {
        {
            let mut state = self.cell.write_state();
            if state.status != JobStatus::Queued {
                return;
            }
            state.status = JobStatus::Running;
            state.started_at = Some(Utc::now());
        }
        self.notify();
    }

    /// Append text to the job output. Ignored once the job is terminal.
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        {
            let mut state = self.cell.write_state();
            if state.status.is_terminal() || state.output_capped {
                return;
            }
            let room = self.max_output_bytes.saturating_sub(state.output.len());
            if text.len() <= room {
                state.output.push_str(text);
            } else {
                let mut cut = room;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                state.output.push_str(&text[..cut]);
                state.output.push_str(OUTPUT_LIMIT_MARKER);
                state.output_capped = true;
                warn!(job_id = %self.cell.id, limit = self.max_output_bytes, "Job output limit reached");
            }
        }
        self.notify();
    }

    /// Record the terminal transition. Returns false (and changes nothing) if
    /// the job already finished or `status` is not terminal.
    pub fn finish(
        &self,
        status: JobStatus,
        exit_code: Option<i32>,
        failure: Option<FailureKind>,
    ) -> bool {
        if !status.is_terminal() {
            return false;
        }
        {
            let mut state = self.cell.write_state();
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.exit_code = exit_code;
            state.failure = failure;
            state.finished_at = Some(Utc::now());
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        debug!(job_id = %self.cell.id, status = %status, ?exit_code, "Job finished");
        self.notify();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.cell.status().is_terminal()
    }
}

impl Drop for JobWriter {
    fn drop(&mut self) {
        if !self.is_finished() {
            warn!(job_id = %self.cell.id, "Job writer dropped before a terminal status");
            self.append(RUNNER_LOST_MARKER);
            self.finish(JobStatus::Error, None, Some(FailureKind::RunnerLost));
        }
    }
}

/// Concurrency-safe map from job id to job state.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobCell>>,
    policy: RetentionPolicy,
    live: Arc<AtomicUsize>,
}

impl JobRegistry {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            jobs: DashMap::new(),
            policy,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Claim a live-job slot, or fail if the limit is reached.
    fn reserve_slot(&self) -> Result<(), JobError> {
        let limit = self.policy.max_running_jobs;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| JobError::TooManyJobs { limit })
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Register a new `queued` job and hand back its only writer.
    pub fn create(&self, label: impl Into<String>) -> Result<(JobId, JobWriter), JobError> {
        self.prune();

        self.reserve_slot()?;

        let label = label.into();
        loop {
            let id = JobId::new();
            if let Entry::Vacant(slot) = self.jobs.entry(id) {
                let (tx, rx) = watch::channel(0u64);
                let cell = Arc::new(JobCell {
                    id,
                    state: RwLock::new(JobState {
                        label: label.clone(),
                        status: JobStatus::Queued,
                        output: String::new(),
                        output_capped: false,
                        exit_code: None,
                        failure: None,
                        created_at: Utc::now(),
                        started_at: None,
                        finished_at: None,
                        cancel_requested: false,
                    }),
                    cancel: CancellationToken::new(),
                    changes: rx,
                });
                slot.insert(Arc::clone(&cell));
                debug!(job_id = %id, label = %label, "Job created");
                return Ok((
                    id,
                    JobWriter {
                        cell,
                        tx,
                        max_output_bytes: self.policy.max_output_bytes,
                        live: Arc::clone(&self.live),
                    },
                ));
            }
        }
    }

    pub fn get(&self, id: &JobId) -> Result<Arc<JobCell>, JobError> {
        self.jobs
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(JobError::NotFound { id: *id })
    }

    pub fn summary(&self, id: &JobId) -> Result<JobSummary, JobError> {
        Ok(self.get(id)?.summary())
    }

    pub fn read(&self, id: &JobId, offset: usize) -> Result<OutputSlice, JobError> {
        self.get(id)?.read(offset)
    }

    pub fn cancel(&self, id: &JobId) -> Result<JobSummary, JobError> {
        Ok(self.get(id)?.request_cancel())
    }

    pub fn subscribe(&self, id: &JobId) -> Result<watch::Receiver<u64>, JobError> {
        Ok(self.get(id)?.subscribe())
    }

    /// All retained jobs, newest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self.jobs.iter().map(|e| e.value().summary()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs created and not yet finished.
    pub fn running_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Request cancellation of every job that has not finished yet.
    pub fn cancel_all(&self) -> usize {
        let cells: Vec<Arc<JobCell>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut cancelled = 0;
        for cell in cells {
            if !cell.status().is_terminal() {
                cell.request_cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Evict finished jobs past the retention window or beyond the count
    /// limit. Queued and running jobs are never evicted.
    pub fn prune(&self) -> usize {
        let mut finished: Vec<(JobId, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter_map(|e| e.value().finished_at().map(|at| (*e.key(), at)))
            .collect();
        finished.sort_by_key(|(_, at)| *at);

        let window = chrono::Duration::from_std(self.policy.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let expired = finished.iter().take_while(|(_, at)| *at <= cutoff).count();
        let over_limit = finished.len().saturating_sub(self.policy.max_finished_jobs);
        let evict = expired.max(over_limit);

        for (id, _) in &finished[..evict] {
            self.jobs.remove(id);
        }
        if evict > 0 {
            debug!(evicted = evict, remaining = self.jobs.len(), "Pruned finished jobs");
        }
        evict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(RetentionPolicy::default())
    }

    #[test]
    fn test_create_starts_queued_without_exit_code() {
        let reg = registry();
        let (id, _writer) = reg.create("unit").unwrap();
        let summary = reg.summary(&id).unwrap();
        assert_eq!(summary.status, JobStatus::Queued);
        assert_eq!(summary.exit_code, None);
        assert_eq!(summary.output_length, 0);
        assert!(!summary.cancel_requested);
    }

    #[test]
    fn test_ids_are_unique() {
        let reg = JobRegistry::new(RetentionPolicy {
            max_running_jobs: 0,
            ..RetentionPolicy::default()
        });
        let mut seen = std::collections::HashSet::new();
        let mut writers = Vec::new();
        for _ in 0..200 {
            let (id, writer) = reg.create("x").unwrap();
            assert!(seen.insert(id));
            writers.push(writer);
        }
        assert_eq!(reg.len(), 200);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let reg = registry();
        let missing = JobId::new();
        assert!(matches!(reg.read(&missing, 0), Err(JobError::NotFound { .. })));
        assert!(matches!(reg.cancel(&missing), Err(JobError::NotFound { .. })));
    }

    #[test]
    fn test_read_returns_suffix_from_every_offset() {
        let reg = registry();
        let (id, writer) = reg.create("slices").unwrap();
        writer.mark_running();
        writer.append("hello\n");
        writer.append("wörld ✓\n");

        let cell = reg.get(&id).unwrap();
        let full = cell.read(0).unwrap();
        let text = full.data.clone();
        assert_eq!(full.full_length, text.len());

        for offset in 0..=text.len() {
            if !text.is_char_boundary(offset) {
                assert!(matches!(cell.read(offset), Err(JobError::InvalidOffset { .. })));
                continue;
            }
            let slice = cell.read(offset).unwrap();
            assert_eq!(slice.data, &text[offset..]);
            assert_eq!(slice.full_length, text.len());
        }
    }

    #[test]
    fn test_read_is_idempotent_and_resyncs_past_end() {
        let reg = registry();
        let (id, writer) = reg.create("idempotent").unwrap();
        writer.append("abc");

        let a = reg.read(&id, 1).unwrap();
        let b = reg.read(&id, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.data, "bc");

        let past = reg.read(&id, 99).unwrap();
        assert_eq!(past.data, "");
        assert_eq!(past.full_length, 3);
    }

    #[test]
    fn test_advancing_offsets_reconstruct_output_once() {
        let reg = registry();
        let (id, writer) = reg.create("reassemble").unwrap();
        let mut offset = 0;
        let mut rebuilt = String::new();
        let pieces = ["one ", "", "two ", "three\n", "✓"];
        for piece in pieces {
            writer.append(piece);
            let slice = reg.read(&id, offset).unwrap();
            rebuilt.push_str(&slice.data);
            offset = slice.full_length;
            // A repeated read at the new offset adds nothing.
            assert_eq!(reg.read(&id, offset).unwrap().data, "");
        }
        assert_eq!(rebuilt, pieces.concat());
    }

    #[test]
    fn test_exactly_one_terminal_transition() {
        let reg = registry();
        let (id, writer) = reg.create("terminal").unwrap();
        writer.mark_running();
        assert!(writer.finish(JobStatus::Completed, Some(0), None));
        assert!(!writer.finish(JobStatus::Error, Some(1), Some(FailureKind::NonZeroExit)));
        assert!(!writer.finish(JobStatus::Running, None, None));

        let summary = reg.summary(&id).unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.exit_code, Some(0));
        assert!(summary.duration.is_some());
    }

    #[test]
    fn test_appends_after_finish_are_ignored() {
        let reg = registry();
        let (id, writer) = reg.create("sealed").unwrap();
        writer.append("before");
        writer.finish(JobStatus::Completed, Some(0), None);
        writer.append("after");
        assert_eq!(reg.read(&id, 0).unwrap().data, "before");
    }

    #[test]
    fn test_running_slice_hides_exit_code() {
        let reg = registry();
        let (id, writer) = reg.create("running").unwrap();
        writer.mark_running();
        let slice = reg.read(&id, 0).unwrap();
        assert_eq!(slice.status, JobStatus::Running);
        assert_eq!(slice.exit_code, None);
        assert_eq!(slice.duration, None);
    }

    #[test]
    fn test_dropped_writer_marks_runner_lost() {
        let reg = registry();
        let (id, writer) = reg.create("lost").unwrap();
        writer.mark_running();
        drop(writer);

        let summary = reg.summary(&id).unwrap();
        assert_eq!(summary.status, JobStatus::Error);
        assert_eq!(summary.failure, Some(FailureKind::RunnerLost));
        assert!(reg.read(&id, 0).unwrap().data.contains("runner exited"));
    }

    #[test]
    fn test_output_limit_truncates_on_char_boundary() {
        let reg = JobRegistry::new(RetentionPolicy {
            max_output_bytes: 5,
            ..RetentionPolicy::default()
        });
        let (id, writer) = reg.create("capped").unwrap();
        writer.append("abcd");
        writer.append("€€"); // 3-byte chars, only 1 byte of room
        writer.append("more");

        let data = reg.read(&id, 0).unwrap().data;
        assert!(data.starts_with("abcd"));
        assert!(data.contains("output limit reached"));
        assert!(!data.contains('€'));
        assert!(!data.contains("more"));
    }

    #[test]
    fn test_cancel_sets_flag_and_token() {
        let reg = registry();
        let (id, writer) = reg.create("cancel").unwrap();
        let token = writer.cancel_token();
        let summary = reg.cancel(&id).unwrap();
        assert!(summary.cancel_requested);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_after_finish_is_noop() {
        let reg = registry();
        let (id, writer) = reg.create("done").unwrap();
        writer.finish(JobStatus::Completed, Some(0), None);
        let summary = reg.cancel(&id).unwrap();
        assert!(!summary.cancel_requested);
        assert!(!writer.cancel_token().is_cancelled());
    }

    #[test]
    fn test_too_many_running_jobs() {
        let reg = JobRegistry::new(RetentionPolicy {
            max_running_jobs: 2,
            ..RetentionPolicy::default()
        });
        let (_a, wa) = reg.create("a").unwrap();
        let (_b, _wb) = reg.create("b").unwrap();
        assert!(matches!(reg.create("c"), Err(JobError::TooManyJobs { limit: 2 })));

        wa.finish(JobStatus::Completed, Some(0), None);
        assert!(reg.create("c").is_ok());
    }

    #[test]
    fn test_concurrent_creates_never_exceed_limit() {
        let reg = Arc::new(JobRegistry::new(RetentionPolicy {
            max_running_jobs: 3,
            ..RetentionPolicy::default()
        }));
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let reg = Arc::clone(&reg);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    reg.create(format!("job-{i}")).ok().map(|(_, writer)| writer)
                })
            })
            .collect();
        let writers: Vec<JobWriter> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(writers.len(), 3);
        assert_eq!(reg.running_count(), 3);
        drop(writers);
        assert_eq!(reg.running_count(), 0);
        assert!(reg.create("after").is_ok());
    }

    #[test]
    fn test_prune_by_count_keeps_newest_and_running() {
        let reg = JobRegistry::new(RetentionPolicy {
            max_finished_jobs: 2,
            max_running_jobs: 0,
            ..RetentionPolicy::default()
        });
        let (running, _keep) = reg.create("running").unwrap();
        let mut finished = Vec::new();
        for i in 0..4 {
            let (id, writer) = reg.create(format!("job-{}", i)).unwrap();
            writer.finish(JobStatus::Completed, Some(0), None);
            finished.push(id);
            std::thread::sleep(Duration::from_millis(2));
        }

        reg.prune();
        assert!(reg.get(&running).is_ok());
        assert!(reg.get(&finished[0]).is_err());
        assert!(reg.get(&finished[1]).is_err());
        assert!(reg.get(&finished[2]).is_ok());
        assert!(reg.get(&finished[3]).is_ok());
    }

    #[test]
    fn test_prune_by_age() {
        let reg = JobRegistry::new(RetentionPolicy {
            retention: Duration::ZERO,
            ..RetentionPolicy::default()
        });
        let (done, writer) = reg.create("old").unwrap();
        writer.finish(JobStatus::Error, Some(1), Some(FailureKind::NonZeroExit));
        let (live, _live_writer) = reg.create("live").unwrap();

        // create() already pruned the finished job.
        assert!(reg.get(&done).is_err());
        assert!(reg.get(&live).is_ok());
    }

    #[test]
    fn test_list_is_newest_first() {
        let reg = registry();
        let (first, _w1) = reg.create("first").unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let (second, _w2) = reg.create("second").unwrap();
        let ids: Vec<JobId> = reg.list().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[tokio::test]
    async fn test_subscribe_ticks_on_append() {
        let reg = registry();
        let (id, writer) = reg.create("watch").unwrap();
        let mut rx = reg.subscribe(&id).unwrap();
        rx.borrow_and_update();

        writer.append("tick");
        rx.changed().await.unwrap();
        assert_eq!(reg.read(&id, 0).unwrap().data, "tick");

        drop(writer);
        // The drop marks the job failed and then closes the feed.
        let _ = rx.changed().await;
        assert!(rx.changed().await.is_err());
        assert_eq!(reg.summary(&id).unwrap().status, JobStatus::Error);
    }
}
