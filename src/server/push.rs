//! Push-framed responses: one long-lived body per job.
//!
//! A frame task follows the job through its watch channel and writes
//! `start`, then `output` per observed batch, then exactly one terminal
//! frame. A batch larger than [`OUTPUT_FRAME_BYTES`] is split over several
//! `output` frames. Each frame is its own body chunk so it is flushed as
//! written.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use devjobs_common::{
    FailureKind, JobId, JobStatus, OutputSlice, StreamEvent, encode_frame,
};
use futures::SinkExt;
use futures::channel::mpsc;
use tracing::{debug, warn};

use crate::jobs::{JobCell, JobRegistry};
use crate::util::char_chunks;

/// Frames buffered ahead of a slow client before the frame task waits.
const FRAME_BUFFER: usize = 32;

/// Largest `output` payload per frame, in bytes.
pub const OUTPUT_FRAME_BYTES: usize = 64 * 1024;

type FrameSender = mpsc::Sender<Result<String, Infallible>>;

/// The receiving end went away; the job keeps running.
struct Disconnected;

/// Build a `text/event-stream` response that follows job `id` to completion.
pub fn push_response(registry: Arc<JobRegistry>, id: JobId, target: Option<String>) -> Response {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(async move {
        if stream_job(&registry, id, target.as_deref(), tx).await.is_err() {
            debug!(job_id = %id, "Push client disconnected; job continues");
        }
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(rx),
    )
        .into_response()
}

async fn send(tx: &mut FrameSender, event: &StreamEvent) -> Result<(), Disconnected> {
    tx.send(Ok(encode_frame(event))).await.map_err(|_| Disconnected)
}

async fn stream_job(
    registry: &JobRegistry,
    id: JobId,
    target: Option<&str>,
    mut tx: FrameSender,
) -> Result<(), Disconnected> {
    let cell = match registry.get(&id) {
        Ok(cell) => cell,
        Err(e) => {
            return send(&mut tx, &StreamEvent::Error { message: e.to_string() }).await;
        }
    };

    send(
        &mut tx,
        &StreamEvent::Start {
            message: format!("Starting {}", cell.label()),
            job_id: Some(id),
        },
    )
    .await?;

    follow(&cell, target, &mut tx).await
}

async fn follow(
    cell: &JobCell,
    target: Option<&str>,
    tx: &mut FrameSender,
) -> Result<(), Disconnected> {
    let mut changes = cell.subscribe();
    let mut offset = 0;
    let mut writer_gone = false;

    loop {
        // Mark the current version seen before reading so an append racing
        // this read still wakes the next `changed()`.
        let _ = changes.borrow_and_update();

        let slice = match cell.read(offset) {
            Ok(slice) => slice,
            Err(e) => {
                warn!(job_id = %cell.id(), error = %e, "Push read failed");
                return send(tx, &StreamEvent::Error { message: e.to_string() }).await;
            }
        };
        offset = slice.full_length;

        for piece in char_chunks(&slice.data, OUTPUT_FRAME_BYTES) {
            send(
                tx,
                &StreamEvent::Output {
                    data: piece.to_string(),
                },
            )
            .await?;
        }

        if slice.status.is_terminal() {
            return send(tx, &terminal_event(&slice, target)).await;
        }

        if writer_gone {
            return send(
                tx,
                &StreamEvent::Error {
                    message: "Job ended without reporting a result".to_string(),
                },
            )
            .await;
        }

        if changes.changed().await.is_err() {
            writer_gone = true;
        }
    }
}

/// Map a terminal job state onto the frame that closes the stream.
pub fn terminal_event(slice: &OutputSlice, target: Option<&str>) -> StreamEvent {
    let target = target.map(str::to_string);
    match (slice.status, slice.failure) {
        (JobStatus::Completed, _) => StreamEvent::Complete {
            success: true,
            target,
            exit_code: slice.exit_code,
            duration: slice.duration,
        },
        (JobStatus::Error, Some(FailureKind::NonZeroExit)) => StreamEvent::Complete {
            success: false,
            target,
            exit_code: slice.exit_code,
            duration: slice.duration,
        },
        (status, failure) => StreamEvent::Error {
            message: failure_message(status, failure),
        },
    }
}

fn failure_message(status: JobStatus, failure: Option<FailureKind>) -> String {
    match failure {
        Some(FailureKind::TimedOut) => "Command timed out".to_string(),
        Some(FailureKind::Cancelled) => "Cancelled by user".to_string(),
        Some(FailureKind::SpawnFailed) => "Failed to start command".to_string(),
        Some(FailureKind::RunnerLost) => {
            "Command runner exited without reporting a result".to_string()
        }
        Some(FailureKind::NonZeroExit) => "Command failed".to_string(),
        None if status == JobStatus::Cancelled => "Cancelled by user".to_string(),
        None => format!("Job ended with status {status}"),
    }
}
