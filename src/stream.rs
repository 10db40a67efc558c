//! Byte-stream primitives for the render assembly pipeline.
//!
//! Chunk boundaries are arbitrary everywhere in this pipeline: a tag or a
//! multi-byte character may straddle two chunks, so every consumer that
//! needs text decodes through [`Utf8Carry`] instead of assuming chunks are
//! valid UTF-8 on their own.

pub mod extract;
pub mod stitch;

use std::pin::Pin;

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use thiserror::Error;

/// A boxed byte stream: the common currency between the renderer, the
/// extractors, the stitcher, and the transport layer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, StreamError>> + Send>>;

/// Errors carried inside a byte stream.
///
/// `Clone` because a teed stream delivers the same failure to both branches.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("render failed: {0}")]
    Render(String),

    #[error("stream source failed: {0}")]
    Source(String),

    #[error("invalid UTF-8 in byte stream")]
    InvalidUtf8,

    #[error("preamble dropped before resolving")]
    PreambleDropped,
}

/// Capacity of the bounded channels behind transforms. Small enough that a
/// stalled consumer stops upstream work after a handful of chunks.
pub(crate) const CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

/// Stream over a fixed sequence of chunks.
pub fn from_chunks(chunks: Vec<Vec<u8>>) -> ByteStream {
    Box::pin(futures::stream::iter(
        chunks.into_iter().map(Ok::<_, StreamError>),
    ))
}

/// Single-chunk stream over a string.
pub fn from_text(text: impl Into<String>) -> ByteStream {
    from_chunks(vec![text.into().into_bytes()])
}

/// Drain a stream to completion, collecting its bytes. Test and template
/// helper; production consumers forward chunks instead of collecting.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Vec<u8>, StreamError> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// [`collect_bytes`], decoded as UTF-8.
pub async fn collect_string(stream: ByteStream) -> Result<String, StreamError> {
    let bytes = collect_bytes(stream).await?;
    String::from_utf8(bytes).map_err(|_| StreamError::InvalidUtf8)
}

// ---------------------------------------------------------------------------
// Tee
// ---------------------------------------------------------------------------

/// Split one stream into two independent readable branches.
///
/// Each branch buffers independently, so the slower branch never stalls the
/// faster one and a single upstream source can be read twice without
/// deadlock (the semantics of the platform streams `tee`). A dropped branch
/// stops receiving without closing its sibling; once both branches are
/// dropped the source itself is dropped, propagating cancellation upstream.
pub fn tee(mut source: ByteStream) -> (ByteStream, ByteStream) {
    let (tx_a, rx_a) = mpsc::unbounded();
    let (tx_b, rx_b) = mpsc::unbounded();

    tokio::spawn(async move {
        let mut a_open = true;
        let mut b_open = true;
        while let Some(item) = source.next().await {
            if a_open {
                a_open = tx_a.unbounded_send(item.clone()).is_ok();
            }
            if b_open {
                b_open = tx_b.unbounded_send(item).is_ok();
            }
            if !a_open && !b_open {
                break;
            }
        }
    });

    (Box::pin(rx_a), Box::pin(rx_b))
}

// ---------------------------------------------------------------------------
// Incremental UTF-8 decoding
// ---------------------------------------------------------------------------

/// Incremental UTF-8 decoder.
///
/// Holds the trailing bytes of an incomplete scalar value between chunks
/// (at most three), so a multi-byte character split across a chunk boundary
/// decodes once both halves have arrived.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, prepending bytes carried from the previous one.
    /// Returns the complete text available so far.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String, StreamError> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(text.to_owned()),
            Err(err) => {
                let valid = err.valid_up_to();
                match err.error_len() {
                    // Incomplete trailing sequence: carry it to the next chunk.
                    None => {
                        self.pending = bytes[valid..].to_vec();
                        bytes.truncate(valid);
                        String::from_utf8(bytes).map_err(|_| StreamError::InvalidUtf8)
                    }
                    // Actually malformed bytes.
                    Some(_) => Err(StreamError::InvalidUtf8),
                }
            }
        }
    }

    /// End of stream. Errors if a partial character never completed.
    pub fn finish(self) -> Result<(), StreamError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(StreamError::InvalidUtf8)
        }
    }
}

/// Largest `idx' <= idx` that lies on a char boundary of `s`.
pub(crate) fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
