//! Destinations for job output on the client side.

use std::io::Write;

use devjobs_common::markers::TRUNCATION_MARKER;

use crate::util::tail_start;

/// Receives job output and client-side notices.
pub trait LogSink {
    /// Job output, verbatim.
    fn append(&mut self, text: &str);

    /// A line produced by the client itself (headers, summaries, markers).
    fn notice(&mut self, text: &str) {
        self.append(text);
    }
}

impl<L: LogSink + ?Sized> LogSink for &mut L {
    fn append(&mut self, text: &str) {
        (**self).append(text);
    }

    fn notice(&mut self, text: &str) {
        (**self).notice(text);
    }
}

/// Fan out to two sinks, e.g. the console and a retained copy.
impl<A: LogSink, B: LogSink> LogSink for (A, B) {
    fn append(&mut self, text: &str) {
        self.0.append(text);
        self.1.append(text);
    }

    fn notice(&mut self, text: &str) {
        self.0.notice(text);
        self.1.notice(text);
    }
}

/// In-memory log bounded to `cap` characters.
///
/// Once the cap is exceeded the retained text is the truncation marker
/// followed by the most recent `cap - marker` characters, so it never grows
/// past `cap` and always ends with the latest output.
#[derive(Debug, Clone)]
pub struct TruncatedLog {
    text: String,
    /// Character count of `text`.
    chars: usize,
    cap: usize,
    truncated: bool,
    total_chars: usize,
}

impl TruncatedLog {
    pub fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            cap,
            truncated: false,
            total_chars: 0,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Characters appended over the log's lifetime, retained or not.
    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn len_chars(&self) -> usize {
        self.chars
    }

    fn enforce_cap(&mut self) {
        if self.chars <= self.cap {
            return;
        }
        let marker_chars = TRUNCATION_MARKER.chars().count();
        let keep = self.cap.saturating_sub(marker_chars);
        let start = tail_start(&self.text, keep);

        let mut next = String::with_capacity(TRUNCATION_MARKER.len() + self.text.len() - start);
        if marker_chars <= self.cap {
            next.push_str(TRUNCATION_MARKER);
        }
        next.push_str(&self.text[start..]);
        self.chars = next.chars().count();
        self.text = next;
        self.truncated = true;
    }
}

impl LogSink for TruncatedLog {
    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let added = text.chars().count();
        self.text.push_str(text);
        self.chars += added;
        self.total_chars += added;
        self.enforce_cap();
    }
}

/// Writes output straight to stdout; notices are styled.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    color: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            color: console::colors_enabled(),
        }
    }
}

impl LogSink for ConsoleSink {
    fn append(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn notice(&mut self, text: &str) {
        let styled = if self.color {
            console::style(text).cyan().bold().to_string()
        } else {
            text.to_string()
        };
        self.append(&styled);
    }
}
