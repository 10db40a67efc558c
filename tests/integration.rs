//! Full pipeline: scan → four-pass build → linked artifact → streamed
//! response assembly, the way a transport layer drives the crate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use meridian::link::{ASSET_PLACEHOLDER_PREFIX, MANIFEST_PLACEHOLDER};
use meridian::stream::{collect_string, from_chunks, from_text};
use meridian::{
    assemble_response, build_project, AssemblyOptions, BuildOptions, BuildOutput, BuildPass,
    BuildPlan, BuildRequest, BundlerError, ByteStream, ComponentTree, ModuleBundler, OutputChunk,
    PayloadRenderer, ShellRenderer, StreamError,
};
use serde_json::json;

// ---------------------------------------------------------------------------
// Fixture project
// ---------------------------------------------------------------------------

fn write_file(root: &std::path::Path, relative: &str, content: &str) -> PathBuf {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).expect("Failed to create fixture dir");
    std::fs::write(&path, content).expect("Failed to write fixture file");
    path
}

fn fixture_project() -> (tempfile::TempDir, BuildPlan) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_file(
        root,
        "src/entry.js",
        "import \"./pages/Home.jsx\";\nimport \"./api/save.js\";\n",
    );
    write_file(
        root,
        "src/pages/Home.jsx",
        "\"use client\";\nexport default function Home() {}\n",
    );
    write_file(
        root,
        "src/api/save.js",
        "'use server';\nexport async function save() {}\n",
    );

    let plan = BuildPlan::new(root, "src/entry.js");
    (dir, plan)
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// Engine stub: hashes client entries, retains everything it is given, and
/// re-emits artifacts through transform hooks on the link pass.
struct ScriptedEngine {
    passes: Mutex<Vec<BuildPass>>,
}

impl ScriptedEngine {
    fn new() -> Self {
        Self {
            passes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ModuleBundler for ScriptedEngine {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutput, BundlerError> {
        self.passes.lock().unwrap().push(request.pass);

        if let Some(mut chunks) = request.artifact {
            for chunk in &mut chunks {
                for hooks in &request.hooks {
                    if let Some(transform) = &hooks.transform {
                        if let Some(code) = transform(&chunk.file_name, &chunk.code)? {
                            chunk.code = code;
                        }
                    }
                }
            }
            return Ok(BuildOutput {
                chunks,
                included_modules: HashSet::new(),
            });
        }

        let modules: Vec<String> = request.entries.iter().map(|e| e.import.clone()).collect();
        let output = match request.pass {
            BuildPass::Discovery => BuildOutput {
                chunks: vec![OutputChunk {
                    file_name: "main.js".into(),
                    code: format!(
                        "const homeChunk = \"{ASSET_PLACEHOLDER_PREFIX}src/pages/Home.jsx\";\n\
                         const manifest = {MANIFEST_PLACEHOLDER};\n"
                    ),
                    is_entry: true,
                    is_dynamic_entry: false,
                    modules: modules.clone(),
                    css: Vec::new(),
                    imports: Vec::new(),
                }],
                included_modules: modules.into_iter().collect(),
            },
            BuildPass::RenderBundle => BuildOutput {
                chunks: vec![OutputChunk {
                    file_name: "render.js".into(),
                    code: "// out-of-band renderer".into(),
                    is_entry: true,
                    is_dynamic_entry: false,
                    modules: vec!["render-entry".into()],
                    css: Vec::new(),
                    imports: Vec::new(),
                }],
                included_modules: HashSet::new(),
            },
            BuildPass::ClientAssets => BuildOutput {
                chunks: modules
                    .iter()
                    .map(|module| {
                        let stem = module
                            .rsplit('/')
                            .next()
                            .unwrap()
                            .split('.')
                            .next()
                            .unwrap();
                        OutputChunk {
                            file_name: format!("assets/{stem}.9f8e7d.js"),
                            code: format!("// client chunk for {module}"),
                            is_entry: true,
                            is_dynamic_entry: false,
                            modules: vec![module.clone()],
                            css: vec![format!("assets/{stem}.9f8e7d.css")],
                            imports: Vec::new(),
                        }
                    })
                    .collect(),
                included_modules: HashSet::new(),
            },
            BuildPass::Link => unreachable!("link pass always carries an artifact"),
        };
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Renderers
// ---------------------------------------------------------------------------

struct JsonPayloadRenderer;

#[async_trait]
impl PayloadRenderer for JsonPayloadRenderer {
    async fn render_payload(&self, tree: &ComponentTree) -> Result<ByteStream, StreamError> {
        let text = serde_json::to_string(&tree.root)
            .map_err(|err| StreamError::Render(err.to_string()))?;
        // Streamed in pieces, as a real serializer would emit rows.
        let bytes = text.into_bytes();
        let mid = bytes.len() / 2;
        Ok(from_chunks(vec![bytes[..mid].to_vec(), bytes[mid..].to_vec()]))
    }
}

/// Shell renderer producing an incrementally chunked document.
struct ChunkedShellRenderer;

#[async_trait]
impl ShellRenderer for ChunkedShellRenderer {
    async fn render_shell(&self, payload: ByteStream) -> Result<ByteStream, StreamError> {
        let text = collect_string(payload).await?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|err| StreamError::Render(err.to_string()))?;
        let title = value["title"].as_str().unwrap_or("untitled").to_owned();

        let shell = format!(
            "<html><head><style data-hoist>.page{{margin:0}}</style>\
             <title>{title}</title></head>\
             <body class=\"page\"><div id=\"root\">{title} content</div></body></html>"
        );
        let chunks: Vec<Vec<u8>> = shell
            .as_bytes()
            .chunks(7)
            .map(<[u8]>::to_vec)
            .collect();
        Ok(from_chunks(chunks))
    }
}

// ===========================================================================
// Build + render, end to end
// ===========================================================================

#[tokio::test]
#[serial_test::serial]
async fn build_then_stream_a_response() {
    let (_dir, plan) = fixture_project();
    let engine = ScriptedEngine::new();

    let report = build_project(&engine, plan, BuildOptions::default())
        .await
        .unwrap();

    // Build side: directive partition, hashed assets, linked artifact.
    assert_eq!(report.client_files, vec!["src/pages/Home.jsx"]);
    assert_eq!(report.server_files, vec!["src/api/save.js"]);

    let home = report.manifest.get("src/pages/Home.jsx").unwrap();
    assert_eq!(home.file, "assets/Home.9f8e7d.js");
    assert_eq!(home.css, vec!["assets/Home.9f8e7d.css"]);

    let linked = &report.server_chunks[0].code;
    assert!(linked.contains("\"/assets/Home.9f8e7d.js\""));
    assert!(!linked.contains(ASSET_PLACEHOLDER_PREFIX));
    assert!(!linked.contains(MANIFEST_PLACEHOLDER));

    // Transport side: template references the hashed client entry the way
    // a router would emit it from the manifest.
    let template = format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <script type=\"module\" src=\"/{entry}\"></script></head>\
         <body><!--meridian-body--></body></html>",
        entry = home.file
    );

    let tree = ComponentTree::new(json!({"title": "Home"}));
    let response = assemble_response(
        &JsonPayloadRenderer,
        &ChunkedShellRenderer,
        &tree,
        from_text(template),
        AssemblyOptions::default(),
    )
    .await
    .unwrap();
    let html = collect_string(response).await.unwrap();

    // Head content hoisted into the template head, before its end.
    let style_at = html.find("<style data-hoist>").unwrap();
    let head_end = html.find("</head>").unwrap();
    assert!(style_at < head_end);

    // Template's own head content precedes the hoisted preamble.
    assert!(html.find("meta charset").unwrap() < style_at);

    // Body content replaced the placeholder, tags stripped.
    assert!(html.contains("<body><div id=\"root\">Home content</div>"));
    assert!(!html.contains("<!--meridian-body-->"));
    assert!(!html.contains("class=\"page\""));

    // Hydration payload inlined after the body content.
    let payload_at = html.find("__MERIDIAN_PAYLOAD__").unwrap();
    assert!(payload_at > html.find("Home content").unwrap());
    assert!(html.contains("\"title\":\"Home\""));

    // The hashed script reference survived stitching untouched.
    assert!(html.contains("src=\"/assets/Home.9f8e7d.js\""));
}

#[tokio::test]
#[serial_test::serial]
async fn rebuild_from_fresh_state_is_deterministic() {
    let (_dir, plan) = fixture_project();

    let first = build_project(&ScriptedEngine::new(), plan.clone(), BuildOptions::default())
        .await
        .unwrap();
    let second = build_project(&ScriptedEngine::new(), plan, BuildOptions::default())
        .await
        .unwrap();

    assert_eq!(first.client_files, second.client_files);
    assert_eq!(first.server_files, second.server_files);
    assert_eq!(
        first.manifest.to_json().unwrap(),
        second.manifest.to_json().unwrap()
    );
    assert_eq!(first.server_chunks[0].code, second.server_chunks[0].code);
}
