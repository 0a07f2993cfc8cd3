//! Shared domain types for devjobs.
//!
//! Both halves of the system speak these types: the server builds them from
//! registry state, the client decodes them off the wire.
//!
//! - [`job`]: job identity, lifecycle status and the pull-side read result
//! - [`frame`]: the push-side [`StreamEvent`] and its text framing
//! - [`markers`]: literal text inserted into job logs

pub mod frame;
pub mod job;
pub mod markers;

pub use frame::{FRAME_PREFIX, FRAME_TERMINATOR, StreamEvent, encode_frame};
pub use job::{
    BuildRequest, FailureKind, JobId, JobStatus, JobSummary, OutputSlice, SubmitResponse,
    TestRunRequest,
};
