//! Consumer for push-framed responses.
//!
//! ```text
//!   Idle ──consume()──> Streaming ──complete / error frame──> Terminal
//!                           │
//!                           └──transport error / EOF / fatal decode──> Terminal (synthetic error)
//! ```

use std::fmt::Display;

use devjobs_common::{JobId, StreamEvent};
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::frames::{FrameDecodeError, FrameDecoder};
use super::log::LogSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Terminal,
}

/// How a push-framed job ended, as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub success: bool,
    /// Server error text, or the reason the client gave up.
    pub message: Option<String>,
    pub target: Option<String>,
    pub exit_code: Option<i32>,
    /// Seconds; the server's figure when it sent one, otherwise measured here.
    pub duration: f64,
    pub job_id: Option<JobId>,
    /// Frames that could not be decoded and were skipped.
    pub skipped_frames: usize,
}

pub struct StreamConsumer<L: LogSink> {
    log: L,
    state: StreamState,
    decoder: FrameDecoder,
    started: Option<Instant>,
    job_id: Option<JobId>,
    skipped_frames: usize,
    outcome: Option<StreamOutcome>,
}

impl<L: LogSink> StreamConsumer<L> {
    pub fn new(log: L) -> Self {
        Self::with_decoder(log, FrameDecoder::new())
    }

    pub fn with_decoder(log: L, decoder: FrameDecoder) -> Self {
        Self {
            log,
            state: StreamState::Idle,
            decoder,
            started: None,
            job_id: None,
            skipped_frames: 0,
            outcome: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Job id announced by the `start` frame, once seen.
    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn into_log(self) -> L {
        self.log
    }

    /// Read `stream` one chunk at a time until a terminal frame arrives or
    /// the stream can no longer deliver one.
    ///
    /// Calling this again after a terminal state returns the same outcome.
    pub async fn consume<S, B, E>(&mut self, stream: S) -> StreamOutcome
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        self.state = StreamState::Streaming;
        self.started.get_or_insert_with(Instant::now);

        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => return self.fail(format!("Connection lost: {e}")),
            };
            for frame in self.decoder.push(bytes.as_ref()) {
                if let Some(outcome) = self.handle(frame) {
                    return outcome;
                }
            }
        }

        if let Some(frame) = self.decoder.finish() {
            if let Some(outcome) = self.handle(frame) {
                return outcome;
            }
        }
        self.fail("Stream ended before the job reported a result".to_string())
    }

    /// Apply one decoded frame; returns the outcome once terminal.
    fn handle(&mut self, frame: Result<StreamEvent, FrameDecodeError>) -> Option<StreamOutcome> {
        match frame {
            Ok(StreamEvent::Start { message, job_id }) => {
                if job_id.is_some() {
                    self.job_id = job_id;
                }
                self.log.notice(&format!("▶ {message}\n"));
                None
            }
            Ok(StreamEvent::Output { data }) => {
                self.log.append(&data);
                None
            }
            Ok(StreamEvent::Complete {
                success,
                target,
                exit_code,
                duration,
            }) => {
                let duration = duration.unwrap_or_else(|| self.elapsed());
                let summary = if success {
                    format!("✓ Completed in {duration:.1}s\n")
                } else {
                    match exit_code {
                        Some(code) => format!("✗ Failed with exit code {code} after {duration:.1}s\n"),
                        None => format!("✗ Failed after {duration:.1}s\n"),
                    }
                };
                self.log.notice(&summary);
                Some(self.finish(StreamOutcome {
                    success,
                    message: None,
                    target,
                    exit_code,
                    duration,
                    job_id: self.job_id,
                    skipped_frames: self.skipped_frames,
                }))
            }
            Ok(StreamEvent::Error { message }) => Some(self.fail(message)),
            Err(e) if e.is_fatal() => Some(self.fail(format!("Stream could not be decoded: {e}"))),
            Err(e) => {
                self.skipped_frames += 1;
                warn!(error = %e, "Skipping malformed frame");
                None
            }
        }
    }

    fn elapsed(&self) -> f64 {
        self.started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default()
    }

    fn fail(&mut self, message: String) -> StreamOutcome {
        self.log.notice(&format!("✗ {message}\n"));
        let outcome = StreamOutcome {
            success: false,
            message: Some(message),
            target: None,
            exit_code: None,
            duration: self.elapsed(),
            job_id: self.job_id,
            skipped_frames: self.skipped_frames,
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: StreamOutcome) -> StreamOutcome {
        debug!(success = outcome.success, job_id = ?outcome.job_id, "Stream finished");
        self.state = StreamState::Terminal;
        self.outcome = Some(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::log::TruncatedLog;
    use devjobs_common::encode_frame;
    use futures::stream;

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        stream::iter(parts.into_iter().map(Ok))
    }

    fn body(events: &[StreamEvent]) -> Vec<u8> {
        events.iter().map(encode_frame).collect::<String>().into_bytes()
    }

    #[tokio::test]
    async fn test_happy_path_with_split_chunks() {
        let id = JobId::new();
        let bytes = body(&[
            StreamEvent::Start {
                message: "Building frontend".into(),
                job_id: Some(id),
            },
            StreamEvent::Output {
                data: "vite v5 building ✓\n".into(),
            },
            StreamEvent::Complete {
                success: true,
                target: Some("frontend".into()),
                exit_code: Some(0),
                duration: Some(4.2),
            },
        ]);
        let parts: Vec<Vec<u8>> = bytes.chunks(7).map(<[u8]>::to_vec).collect();

        let mut consumer = StreamConsumer::new(TruncatedLog::new(10_000));
        assert_eq!(consumer.state(), StreamState::Idle);
        let outcome = consumer.consume(chunks(parts)).await;

        assert_eq!(consumer.state(), StreamState::Terminal);
        assert!(outcome.success);
        assert_eq!(outcome.job_id, Some(id));
        assert_eq!(outcome.target.as_deref(), Some("frontend"));
        assert_eq!(outcome.duration, 4.2);
        let text = consumer.log().text();
        assert!(text.starts_with("▶ Building frontend\n"));
        assert!(text.contains("vite v5 building ✓\n"));
    }

    #[tokio::test]
    async fn test_stops_reading_after_terminal_frame() {
        let mut bytes = body(&[
            StreamEvent::Error {
                message: "Command timed out".into(),
            },
            StreamEvent::Output {
                data: "late".into(),
            },
        ]);
        bytes.extend_from_slice(b"garbage");

        let mut consumer = StreamConsumer::new(TruncatedLog::new(1000));
        let outcome = consumer.consume(chunks(vec![bytes])).await;
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("Command timed out"));
        assert!(!consumer.log().text().contains("late"));
    }

    #[tokio::test]
    async fn test_failed_build_reports_exit_code() {
        let bytes = body(&[StreamEvent::Complete {
            success: false,
            target: None,
            exit_code: Some(2),
            duration: None,
        }]);
        let mut consumer = StreamConsumer::new(TruncatedLog::new(1000));
        let outcome = consumer.consume(chunks(vec![bytes])).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(2));
        assert!(outcome.duration >= 0.0);
        assert!(consumer.log().text().contains("exit code 2"));
    }

    #[tokio::test]
    async fn test_eof_without_terminal_frame_is_error() {
        let bytes = body(&[StreamEvent::Output { data: "x".into() }]);
        let mut consumer = StreamConsumer::new(TruncatedLog::new(1000));
        let outcome = consumer.consume(chunks(vec![bytes])).await;
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("ended before"));
        assert_eq!(consumer.state(), StreamState::Terminal);
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let parts: Vec<Result<Vec<u8>, String>> = vec![
            Ok(body(&[StreamEvent::Output { data: "x".into() }])),
            Err("connection reset".to_string()),
        ];
        let mut consumer = StreamConsumer::new(TruncatedLog::new(1000));
        let outcome = consumer.consume(stream::iter(parts)).await;
        assert!(outcome.message.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let mut bytes = b"data: {oops\n\n".to_vec();
        bytes.extend(body(&[StreamEvent::Complete {
            success: true,
            target: None,
            exit_code: Some(0),
            duration: Some(1.0),
        }]));
        let mut consumer = StreamConsumer::new(TruncatedLog::new(1000));
        let outcome = consumer.consume(chunks(vec![bytes])).await;
        assert!(outcome.success);
        assert_eq!(outcome.skipped_frames, 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_decode_error_does_not_hang() {
        let mut consumer =
            StreamConsumer::with_decoder(TruncatedLog::new(1000), FrameDecoder::with_limit(8));
        let parts = vec![b"data: {\"type\":\"output\"".to_vec(), b"...".to_vec()];
        let outcome = consumer.consume(chunks(parts)).await;
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("could not be decoded"));
    }

    #[tokio::test]
    async fn test_consume_after_terminal_returns_same_outcome() {
        let bytes = body(&[StreamEvent::Error {
            message: "Cancelled by user".into(),
        }]);
        let mut consumer = StreamConsumer::new(TruncatedLog::new(1000));
        let first = consumer.consume(chunks(vec![bytes])).await;
        let second = consumer
            .consume(chunks(vec![b"data: {}\n\n".to_vec()]))
            .await;
        assert_eq!(first, second);
    }
}
