//! Incremental extractors over the rendered HTML shell stream.
//!
//! Two cooperating parsers consume independent tee branches of the same
//! shell stream:
//!
//! - [`extract_preamble`] — pass-through sink that captures the inner head
//!   content and resolves a oneshot once the head region ends
//! - [`extract_body`] — transform that re-emits only the inner body
//!   content, incrementally
//!
//! Both tolerate attribute/whitespace/case variance on the tags and arbitrary
//! chunk boundaries: a tag or multi-byte character split across two chunks
//! scans identically to the unsplit stream. The pure scanner state machines
//! ([`PreambleScanner`], [`BodyScanner`]) are separate from the task
//! plumbing so every split point is unit-testable.

use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use tracing::warn;

use crate::stream::{ByteStream, StreamError, Utf8Carry, CHANNEL_CAPACITY};

// ---------------------------------------------------------------------------
// Tag search
// ---------------------------------------------------------------------------

/// Outcome of scanning a buffer for a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagSearch {
    /// Tag located: `start` is the byte offset of `<`, `end` is just past `>`.
    Found { start: usize, end: usize },
    /// A tag opener begins at `start` but its end has not arrived yet.
    Partial { start: usize },
    /// No tag; everything before `keep_from` can never be part of one.
    NotFound { keep_from: usize },
}

/// Longest proper prefix of `needle` that the buffer ends with.
fn partial_hold(lower: &str, needle: &str) -> usize {
    let max_k = (needle.len() - 1).min(lower.len());
    for k in (1..=max_k).rev() {
        if lower.ends_with(&needle[..k]) {
            return k;
        }
    }
    0
}

/// Case-insensitive search for an opening `<name …>` tag.
fn find_open_tag(buf: &str, name: &str) -> TagSearch {
    let lower = buf.to_ascii_lowercase();
    let needle = format!("<{name}");
    let mut from = 0;

    while let Some(rel) = lower[from..].find(&needle) {
        let start = from + rel;
        let after = start + needle.len();
        match lower.as_bytes().get(after) {
            None => return TagSearch::Partial { start },
            Some(b'>') => return TagSearch::Found { start, end: after + 1 },
            Some(c) if c.is_ascii_whitespace() || *c == b'/' => {
                return match lower[after..].find('>') {
                    Some(gt) => TagSearch::Found { start, end: after + gt + 1 },
                    None => TagSearch::Partial { start },
                };
            }
            // `<bodyx…` — some other tag; keep looking.
            _ => from = start + 1,
        }
    }

    let hold = partial_hold(&lower, &needle);
    TagSearch::NotFound { keep_from: buf.len() - hold }
}

/// Case-insensitive search for a closing `</name>` tag, tolerating
/// whitespace before the `>`.
fn find_close_tag(buf: &str, name: &str) -> TagSearch {
    let lower = buf.to_ascii_lowercase();
    let needle = format!("</{name}");
    let mut from = 0;

    while let Some(rel) = lower[from..].find(&needle) {
        let start = from + rel;
        let mut cursor = start + needle.len();
        loop {
            match lower.as_bytes().get(cursor) {
                None => return TagSearch::Partial { start },
                Some(b'>') => return TagSearch::Found { start, end: cursor + 1 },
                Some(c) if c.is_ascii_whitespace() => cursor += 1,
                Some(_) => break,
            }
        }
        from = start + 1;
    }

    let hold = partial_hold(&lower, &needle);
    TagSearch::NotFound { keep_from: buf.len() - hold }
}

// ---------------------------------------------------------------------------
// PreambleScanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreambleState {
    SeekOpen,
    Capturing,
    Done,
}

/// Pure incremental scanner for the inner head content.
///
/// Feed decoded text with [`push`](Self::push); returns the captured
/// preamble once the end of the head region has been identified.
#[derive(Debug)]
pub struct PreambleScanner {
    state: PreambleState,
    buf: String,
    captured: String,
}

impl PreambleScanner {
    pub fn new() -> Self {
        Self {
            state: PreambleState::SeekOpen,
            buf: String::new(),
            captured: String::new(),
        }
    }

    /// Whether the preamble has already been produced.
    pub fn done(&self) -> bool {
        self.state == PreambleState::Done
    }

    pub fn push(&mut self, text: &str) -> Option<String> {
        if self.done() {
            return None;
        }
        self.buf.push_str(text);
        loop {
            match self.state {
                PreambleState::SeekOpen => match find_open_tag(&self.buf, "head") {
                    TagSearch::Found { end, .. } => {
                        self.buf.drain(..end);
                        self.state = PreambleState::Capturing;
                    }
                    TagSearch::Partial { start } => {
                        self.buf.drain(..start);
                        return None;
                    }
                    TagSearch::NotFound { keep_from } => {
                        self.buf.drain(..keep_from);
                        return None;
                    }
                },
                PreambleState::Capturing => match find_close_tag(&self.buf, "head") {
                    TagSearch::Found { start, .. } => {
                        self.captured.push_str(&self.buf[..start]);
                        self.buf.clear();
                        self.state = PreambleState::Done;
                        return Some(std::mem::take(&mut self.captured));
                    }
                    TagSearch::Partial { start } => {
                        self.captured.push_str(&self.buf[..start]);
                        self.buf.drain(..start);
                        return None;
                    }
                    TagSearch::NotFound { keep_from } => {
                        self.captured.push_str(&self.buf[..keep_from]);
                        self.buf.drain(..keep_from);
                        return None;
                    }
                },
                PreambleState::Done => return None,
            }
        }
    }
}

impl Default for PreambleScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// BodyScanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    SeekOpen,
    Streaming,
    Done,
}

/// Pure incremental scanner that passes through only inner body content.
#[derive(Debug)]
pub struct BodyScanner {
    state: BodyState,
    buf: String,
}

impl BodyScanner {
    pub fn new() -> Self {
        Self {
            state: BodyState::SeekOpen,
            buf: String::new(),
        }
    }

    /// Whether the closing body tag has been consumed.
    pub fn done(&self) -> bool {
        self.state == BodyState::Done
    }

    /// Feed decoded text; returns the body content ready to emit.
    pub fn push(&mut self, text: &str) -> String {
        let mut out = String::new();
        if self.done() {
            return out;
        }
        self.buf.push_str(text);
        loop {
            match self.state {
                BodyState::SeekOpen => match find_open_tag(&self.buf, "body") {
                    TagSearch::Found { end, .. } => {
                        self.buf.drain(..end);
                        self.state = BodyState::Streaming;
                    }
                    TagSearch::Partial { start } => {
                        self.buf.drain(..start);
                        return out;
                    }
                    TagSearch::NotFound { keep_from } => {
                        self.buf.drain(..keep_from);
                        return out;
                    }
                },
                BodyState::Streaming => match find_close_tag(&self.buf, "body") {
                    TagSearch::Found { start, .. } => {
                        out.push_str(&self.buf[..start]);
                        self.buf.clear();
                        self.state = BodyState::Done;
                        return out;
                    }
                    TagSearch::Partial { start } => {
                        out.push_str(&self.buf[..start]);
                        self.buf.drain(..start);
                        return out;
                    }
                    TagSearch::NotFound { keep_from } => {
                        out.push_str(&self.buf[..keep_from]);
                        self.buf.drain(..keep_from);
                        return out;
                    }
                },
                BodyState::Done => {
                    self.buf.clear();
                    return out;
                }
            }
        }
    }

    /// End of stream. Text held back as a potential partial close tag is
    /// body content after all if the tag never completed.
    pub fn finish(self) -> String {
        match self.state {
            BodyState::Streaming => self.buf,
            _ => String::new(),
        }
    }
}

impl Default for BodyScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Task plumbing
// ---------------------------------------------------------------------------

/// Run the preamble extractor over one tee branch of the shell stream.
///
/// The returned oneshot resolves with the inner head content as soon as the
/// head region ends; the branch is dropped afterwards (a closed tee branch
/// never stalls its sibling). A shell that ends without a head region
/// resolves to an empty preamble with a warning.
pub fn extract_preamble(mut branch: ByteStream) -> oneshot::Receiver<Result<String, StreamError>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut decoder = Utf8Carry::new();
        let mut scanner = PreambleScanner::new();

        while let Some(item) = branch.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            };
            let text = match decoder.decode(&chunk) {
                Ok(text) => text,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            };
            if let Some(preamble) = scanner.push(&text) {
                let _ = tx.send(Ok(preamble));
                return;
            }
        }

        warn!("shell stream ended without a head region; preamble is empty");
        let _ = tx.send(Ok(String::new()));
    });

    rx
}

/// Run the body extractor over one tee branch of the shell stream.
///
/// Emits only the inner body content, incrementally; the surrounding tag and
/// everything outside it are stripped. Reading stops at the closing body tag.
pub fn extract_body(mut branch: ByteStream) -> ByteStream {
    let (mut tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut decoder = Utf8Carry::new();
        let mut scanner = BodyScanner::new();

        while let Some(item) = branch.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
            let text = match decoder.decode(&chunk) {
                Ok(text) => text,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
            let out = scanner.push(&text);
            if !out.is_empty() && tx.send(Ok(out.into_bytes())).await.is_err() {
                return;
            }
            if scanner.done() {
                return;
            }
        }

        let tail = scanner.finish();
        if !tail.is_empty() {
            let _ = tx.send(Ok(tail.into_bytes())).await;
        }
    });

    Box::pin(rx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
