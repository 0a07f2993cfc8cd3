//! Client half: talks to a devjobs server and renders job output.
//!
//! - [`stream::StreamConsumer`] reads push-framed build output.
//! - [`poll::PollConsumer`] drives submit + incremental status reads.
//! - Both write into a [`log::LogSink`]; [`log::TruncatedLog`] bounds memory.

pub mod frames;
pub mod http;
pub mod log;
pub mod poll;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use devjobs_common::{JobId, JobSummary, OutputSlice, TestRunRequest};

use crate::errors::ClientError;

pub use http::JobsClient;
pub use log::{ConsoleSink, LogSink, TruncatedLog};
pub use poll::{PollConsumer, PollOutcome, PollSettings, PollState, PollTimer};
pub use stream::{StreamConsumer, StreamOutcome, StreamState};

/// Pull-style job operations, implemented over HTTP by [`JobsClient`].
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Start a test run; returns as soon as the server has a job id.
    async fn submit(&self, request: &TestRunRequest) -> Result<JobId, ClientError>;

    /// Output since `offset` plus the authoritative length and status.
    async fn status(&self, id: &JobId, offset: usize) -> Result<OutputSlice, ClientError>;

    async fn coverage_summary(&self) -> Result<serde_json::Value, ClientError>;

    async fn cancel(&self, id: &JobId) -> Result<JobSummary, ClientError>;
}

#[async_trait]
impl<T: JobApi + ?Sized> JobApi for Arc<T> {
    async fn submit(&self, request: &TestRunRequest) -> Result<JobId, ClientError> {
        (**self).submit(request).await
    }

    async fn status(&self, id: &JobId, offset: usize) -> Result<OutputSlice, ClientError> {
        (**self).status(id, offset).await
    }

    async fn coverage_summary(&self) -> Result<serde_json::Value, ClientError> {
        (**self).coverage_summary().await
    }

    async fn cancel(&self, id: &JobId) -> Result<JobSummary, ClientError> {
        (**self).cancel(id).await
    }
}
