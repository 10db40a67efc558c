//! Ordered chunk-rewriting transform over a target stream.
//!
//! A [`StitchJob`] is a list of marker rules applied in one forward pass:
//! string replacements (the value may be computed asynchronously) and
//! sub-stream injections (the injected stream is spliced in at the marker,
//! preserving surrounding content). A rule fires at most once and is spent
//! afterwards; markers are expected to be unique in the target.
//!
//! When several markers are present in the same buffered text, the earliest
//! occurrence is handled first so output stays in document order; ties on
//! position fall to the earlier rule in the list. Matched text is never
//! re-scanned. Injected streams are forwarded chunk-by-chunk as they
//! arrive, so available output flushes without waiting for an injected
//! stream to finish — a deferred replacement value blocks output from its
//! marker onward until it resolves, and no further.

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};

use crate::stream::{floor_char_boundary, ByteStream, StreamError, Utf8Carry, CHANNEL_CAPACITY};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Replacement value for a [`StitchRule::Replace`] rule.
pub enum StitchValue {
    /// Known up front.
    Ready(String),
    /// Computed asynchronously; awaited when the marker is reached.
    Deferred(BoxFuture<'static, Result<String, StreamError>>),
}

impl std::fmt::Debug for StitchValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// One marker rule of a stitch job.
pub enum StitchRule {
    /// Replace the marker with a (possibly deferred) string.
    Replace { marker: String, value: StitchValue },
    /// Splice the full content of another stream in place of the marker.
    Inject { marker: String, stream: ByteStream },
}

impl StitchRule {
    fn marker(&self) -> &str {
        match self {
            Self::Replace { marker, .. } | Self::Inject { marker, .. } => marker,
        }
    }

    /// Replacement with an immediately known value.
    pub fn replace(marker: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Replace {
            marker: marker.into(),
            value: StitchValue::Ready(value.into()),
        }
    }

    /// Replacement resolved by a future at stitch time.
    pub fn replace_deferred(
        marker: impl Into<String>,
        value: BoxFuture<'static, Result<String, StreamError>>,
    ) -> Self {
        Self::Replace {
            marker: marker.into(),
            value: StitchValue::Deferred(value),
        }
    }

    /// Injection of a sub-stream at the marker.
    pub fn inject(marker: impl Into<String>, stream: ByteStream) -> Self {
        Self::Inject {
            marker: marker.into(),
            stream,
        }
    }
}

impl std::fmt::Debug for StitchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace { marker, value } => f
                .debug_struct("Replace")
                .field("marker", marker)
                .field("value", value)
                .finish(),
            Self::Inject { marker, .. } => {
                f.debug_struct("Inject").field("marker", marker).finish()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stitcher
// ---------------------------------------------------------------------------

/// Apply marker rules to the target stream in one forward pass.
///
/// If an injected stream or a deferred value errors, the error propagates to
/// the stitched output and the stream terminates; bytes already flushed are
/// not retracted.
pub fn stitch(target: ByteStream, rules: Vec<StitchRule>) -> ByteStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_stitch(target, rules, tx));
    Box::pin(rx)
}

type StitchSender = mpsc::Sender<Result<Vec<u8>, StreamError>>;

async fn run_stitch(mut target: ByteStream, mut rules: Vec<StitchRule>, mut tx: StitchSender) {
    let mut decoder = Utf8Carry::new();
    let mut buf = String::new();

    while let Some(item) = target.next().await {
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
        buf.push_str(&text);
        if drain_buffer(&mut buf, &mut rules, &mut tx, false).await.is_err() {
            return;
        }
    }

    if decoder.finish().is_err() {
        let _ = tx.send(Err(StreamError::InvalidUtf8)).await;
        return;
    }
    let _ = drain_buffer(&mut buf, &mut rules, &mut tx, true).await;
}

/// Emit as much of the buffer as the pending rules allow. With `at_end` the
/// whole buffer flushes; otherwise a tail short enough to hide a partial
/// marker is held back for the next chunk.
async fn drain_buffer(
    buf: &mut String,
    rules: &mut Vec<StitchRule>,
    tx: &mut StitchSender,
    at_end: bool,
) -> Result<(), ()> {
    loop {
        if rules.is_empty() {
            if !buf.is_empty() {
                emit(tx, std::mem::take(buf).into_bytes()).await?;
            }
            return Ok(());
        }

        // Earliest marker occurrence wins; ties fall to rule order.
        let mut best: Option<(usize, usize)> = None;
        for (idx, rule) in rules.iter().enumerate() {
            if let Some(pos) = buf.find(rule.marker()) {
                if best.map_or(true, |(best_pos, _)| pos < best_pos) {
                    best = Some((pos, idx));
                }
            }
        }

        match best {
            Some((pos, idx)) => {
                let rule = rules.remove(idx);
                let rest = buf.split_off(pos + rule.marker().len());
                buf.truncate(pos);
                if !buf.is_empty() {
                    emit(tx, std::mem::take(buf).into_bytes()).await?;
                }
                apply_rule(rule, tx).await?;
                *buf = rest;
            }
            None => {
                let hold = rules
                    .iter()
                    .map(|rule| rule.marker().len())
                    .max()
                    .unwrap_or(1)
                    .saturating_sub(1);
                if at_end {
                    if !buf.is_empty() {
                        emit(tx, std::mem::take(buf).into_bytes()).await?;
                    }
                } else if buf.len() > hold {
                    let cut = floor_char_boundary(buf, buf.len() - hold);
                    if cut > 0 {
                        let ready: String = buf.drain(..cut).collect();
                        emit(tx, ready.into_bytes()).await?;
                    }
                }
                return Ok(());
            }
        }
    }
}

async fn apply_rule(rule: StitchRule, tx: &mut StitchSender) -> Result<(), ()> {
    match rule {
        StitchRule::Replace { value, .. } => {
            let resolved = match value {
                StitchValue::Ready(text) => text,
                StitchValue::Deferred(future) => match future.await {
                    Ok(text) => text,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return Err(());
                    }
                },
            };
            if !resolved.is_empty() {
                emit(tx, resolved.into_bytes()).await?;
            }
        }
        StitchRule::Inject { mut stream, .. } => {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => emit(tx, chunk).await?,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return Err(());
                    }
                }
            }
        }
    }
    Ok(())
}

async fn emit(tx: &mut StitchSender, bytes: Vec<u8>) -> Result<(), ()> {
    tx.send(Ok(bytes)).await.map_err(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_string, from_chunks, from_text};

    #[tokio::test]
    async fn replace_ready_value() {
        let out = stitch(
            from_text("hello MARKER world"),
            vec![StitchRule::replace("MARKER", "wide")],
        );
        assert_eq!(collect_string(out).await.unwrap(), "hello wide world");
    }

    #[tokio::test]
    async fn replace_deferred_value() {
        let out = stitch(
            from_text("a[X]b"),
            vec![StitchRule::replace_deferred(
                "[X]",
                Box::pin(async { Ok("y".to_string()) }),
            )],
        );
        assert_eq!(collect_string(out).await.unwrap(), "ayb");
    }

    #[tokio::test]
    async fn inject_preserves_surrounding_content() {
        let injected = from_chunks(vec![b"1".to_vec(), b"2".to_vec()]);
        let out = stitch(
            from_text("before|HERE|after"),
            vec![StitchRule::inject("|HERE|", injected)],
        );
        assert_eq!(collect_string(out).await.unwrap(), "before12after");
    }

    #[tokio::test]
    async fn both_rules_in_one_chunk() {
        let injected = from_text("Y");
        let out = stitch(
            from_text("<head>A</head><body>PLACEHOLDER</body>"),
            vec![
                StitchRule::replace("</head>", "X</head>"),
                StitchRule::inject("PLACEHOLDER", injected),
            ],
        );
        assert_eq!(
            collect_string(out).await.unwrap(),
            "<head>AX</head><body>Y</body>"
        );
    }

    #[tokio::test]
    async fn marker_split_across_chunks() {
        let out = stitch(
            from_chunks(vec![b"aaMAR".to_vec(), b"KERbb".to_vec()]),
            vec![StitchRule::replace("MARKER", "-")],
        );
        assert_eq!(collect_string(out).await.unwrap(), "aa-bb");
    }

    #[tokio::test]
    async fn spent_rule_does_not_fire_twice() {
        let out = stitch(
            from_text("x M y M z"),
            vec![StitchRule::replace("M", "1")],
        );
        assert_eq!(collect_string(out).await.unwrap(), "x 1 y M z");
    }

    #[tokio::test]
    async fn no_rules_passes_through() {
        let out = stitch(from_text("untouched"), Vec::new());
        assert_eq!(collect_string(out).await.unwrap(), "untouched");
    }

    #[tokio::test]
    async fn injected_error_propagates() {
        let failing: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(StreamError::Source("mid-stream failure".into())),
        ]));
        let out = stitch(
            from_text("a|M|b"),
            vec![StitchRule::inject("|M|", failing)],
        );
        let mut out = out;
        let mut collected = String::new();
        let mut failed = false;
        while let Some(item) = out.next().await {
            match item {
                Ok(bytes) => collected.push_str(std::str::from_utf8(&bytes).unwrap()),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
        // Bytes flushed before the failure are not retracted.
        assert_eq!(collected, "apartial");
    }
}
