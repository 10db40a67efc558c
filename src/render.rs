//! Render Assembly — composes the renderer, the extractors, and the
//! stitcher into one end-to-end response stream.
//!
//! The full pipeline per request:
//! 1. Render the component tree to a payload stream
//! 2. Tee it — one branch feeds the out-of-band shell renderer, the other
//!    is inlined into the response for hydration
//! 3. Tee the shell stream — one branch resolves the preamble, the other
//!    yields the body content
//! 4. Stitch preamble and body into the document template at the head-end
//!    and body placeholder markers
//!
//! Bytes are emitted in document order without waiting for the whole tree
//! to finish rendering; a dropped response stream propagates cancellation
//! back through the tees to the renderer.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use crate::stream::extract::{extract_body, extract_preamble};
use crate::stream::stitch::{stitch, StitchRule};
use crate::stream::{ByteStream, StreamError, Utf8Carry, CHANNEL_CAPACITY};
use crate::utils;

// ---------------------------------------------------------------------------
// Renderer traits
// ---------------------------------------------------------------------------

/// A component tree handed in by the transport layer.
/// Opaque to the assembly — it is forwarded to the renderers, never
/// interpreted.
#[derive(Debug, Clone)]
pub struct ComponentTree {
    pub root: Value,
}

impl ComponentTree {
    pub fn new(root: Value) -> Self {
        Self { root }
    }
}

/// Serializes a component tree into the streamable payload representation.
#[async_trait]
pub trait PayloadRenderer: Send + Sync {
    async fn render_payload(&self, tree: &ComponentTree) -> Result<ByteStream, StreamError>;
}

/// The out-of-band renderer: turns a payload stream into an HTML shell
/// stream (a full document whose head and body the extractors pick apart).
#[async_trait]
pub trait ShellRenderer: Send + Sync {
    async fn render_shell(&self, payload: ByteStream) -> Result<ByteStream, StreamError>;
}

// ---------------------------------------------------------------------------
// AssemblyOptions
// ---------------------------------------------------------------------------

/// Markers and toggles for one assembled response.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    /// Marker in the template at which head content is hoisted; re-emitted
    /// after the preamble.
    pub head_marker: String,
    /// Placeholder in the template replaced by the body content stream.
    pub body_marker: String,
    /// Whether to append the serialized payload as an inline script after
    /// the body content.
    pub inline_payload: bool,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            head_marker: "</head>".into(),
            body_marker: "<!--meridian-body-->".into(),
            inline_payload: true,
        }
    }
}

/// Element id carrying the inlined payload for client hydration.
pub const PAYLOAD_SCRIPT_ID: &str = "__MERIDIAN_PAYLOAD__";

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Assemble the streamed response for one request.
///
/// Returns as soon as the pipeline is wired; rendering proceeds as the
/// returned stream is consumed. Head content flushes before the body
/// starts, and the body flushes incrementally as the renderer produces it.
pub async fn assemble_response(
    payload_renderer: &dyn PayloadRenderer,
    shell_renderer: &dyn ShellRenderer,
    tree: &ComponentTree,
    template: ByteStream,
    opts: AssemblyOptions,
) -> Result<ByteStream, StreamError> {
    let payload = payload_renderer.render_payload(tree).await?;
    let (shell_branch, inline_branch) = crate::stream::tee(payload);

    let shell = shell_renderer.render_shell(shell_branch).await?;
    let (head_branch, body_branch) = crate::stream::tee(shell);

    let preamble = extract_preamble(head_branch);
    let body = extract_body(body_branch);

    let body: ByteStream = if opts.inline_payload {
        Box::pin(body.chain(payload_script(inline_branch)))
    } else {
        drop(inline_branch);
        body
    };

    let head_marker = opts.head_marker.clone();
    let rules = vec![
        StitchRule::replace_deferred(
            opts.head_marker.clone(),
            Box::pin(async move {
                let preamble = preamble.await.map_err(|_| StreamError::PreambleDropped)??;
                Ok(format!("{preamble}{head_marker}"))
            }),
        ),
        StitchRule::inject(opts.body_marker.clone(), body),
    ];

    Ok(stitch(template, rules))
}

/// Wrap the payload branch in an inline script element, escaping `<` so the
/// payload cannot terminate the element early.
fn payload_script(mut payload: ByteStream) -> ByteStream {
    let (mut tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let open = format!(r#"<script id="{PAYLOAD_SCRIPT_ID}" type="application/json">"#);
        if tx.send(Ok(open.into_bytes())).await.is_err() {
            return;
        }

        let mut decoder = Utf8Carry::new();
        while let Some(item) = payload.next().await {
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
            let escaped = utils::escape_inline_script(&text);
            if !escaped.is_empty() && tx.send(Ok(escaped.into_bytes())).await.is_err() {
                return;
            }
        }

        let _ = tx.send(Ok(b"</script>".to_vec())).await;
    });

    Box::pin(rx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_string, from_text};
    use serde_json::json;

    struct JsonPayloadRenderer;

    #[async_trait]
    impl PayloadRenderer for JsonPayloadRenderer {
        async fn render_payload(&self, tree: &ComponentTree) -> Result<ByteStream, StreamError> {
            let text = serde_json::to_string(&tree.root)
                .map_err(|err| StreamError::Render(err.to_string()))?;
            Ok(from_text(text))
        }
    }

    /// Shell renderer that wraps the payload's `title` field in a document.
    struct TitleShellRenderer;

    #[async_trait]
    impl ShellRenderer for TitleShellRenderer {
        async fn render_shell(&self, payload: ByteStream) -> Result<ByteStream, StreamError> {
            let text = collect_string(payload).await?;
            let value: Value = serde_json::from_str(&text)
                .map_err(|err| StreamError::Render(err.to_string()))?;
            let title = value["title"].as_str().unwrap_or("untitled").to_owned();
            Ok(from_text(format!(
                "<html><head><title>{title}</title></head><body><h1>{title}</h1></body></html>"
            )))
        }
    }

    #[tokio::test]
    async fn assembles_document_in_order() {
        let tree = ComponentTree::new(json!({"title": "Home"}));
        let template = from_text(
            "<!doctype html><html><head><meta charset=\"utf-8\"></head>\
             <body><!--meridian-body--></body></html>",
        );
        let out = assemble_response(
            &JsonPayloadRenderer,
            &TitleShellRenderer,
            &tree,
            template,
            AssemblyOptions::default(),
        )
        .await
        .unwrap();
        let html = collect_string(out).await.unwrap();

        let head_at = html.find("<title>Home</title>").unwrap();
        let body_at = html.find("<h1>Home</h1>").unwrap();
        assert!(head_at < body_at);
        // Preamble hoisted before the original head end, inside the head.
        assert!(head_at < html.find("</head>").unwrap());
        // Payload inlined after the body content.
        let script_at = html.find(PAYLOAD_SCRIPT_ID).unwrap();
        assert!(script_at > body_at);
        assert!(html.contains("\"title\":\"Home\""));
    }

    #[tokio::test]
    async fn inline_payload_can_be_disabled() {
        let tree = ComponentTree::new(json!({"title": "Home"}));
        let template = from_text("<head></head><body><!--meridian-body--></body>");
        let out = assemble_response(
            &JsonPayloadRenderer,
            &TitleShellRenderer,
            &tree,
            template,
            AssemblyOptions {
                inline_payload: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let html = collect_string(out).await.unwrap();
        assert!(!html.contains(PAYLOAD_SCRIPT_ID));
        assert!(html.contains("<h1>Home</h1>"));
    }

    #[tokio::test]
    async fn payload_script_escapes_closing_tags() {
        let payload = from_text(r#"{"html":"</script><script>"}"#);
        let html = collect_string(payload_script(payload)).await.unwrap();
        let inner = html
            .strip_suffix("</script>")
            .unwrap()
            .split_once('>')
            .unwrap()
            .1
            .to_owned();
        assert!(!inner.contains("</script"));
        assert!(inner.contains("\\u003c/script>"));
    }
}
