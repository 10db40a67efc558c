//! Build Orchestrator — four strictly ordered bundler passes.
//!
//! The client bundle must contain only components that survive dead-code
//! elimination in the server bundle, yet the server bundle's final form
//! needs the client bundle's hashed asset names. The orchestrator resolves
//! that circularity without loops:
//!
//! 1. **Discovery** — server bundle from the full scanned entry set; its
//!    inclusion report filters the directive accumulator
//! 2. **Secondary render** — out-of-band renderer bundle from the filtered
//!    server output
//! 3. **Client assets** — client bundle from the filtered client files (or
//!    a default synthetic entry); emits the asset manifest
//! 4. **Link** — re-emits the discovery artifact with placeholders
//!    substituted; same logical entries as pass 1
//!
//! Any pass failing aborts the sequence with the pass number attached; no
//! retry; restart begins at pass 1.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::bundler::{
    BuildHooks, BuildOutput, BuildRequest, FsResolver, InputItem, ModuleBundler, OutputChunk,
    SyntheticModules, SyntheticSourceProvider,
};
use crate::link::{leftover_placeholders, Linker, MANIFEST_PLACEHOLDER};
use crate::manifest::Manifest;
use crate::render::PAYLOAD_SCRIPT_ID;
use crate::scan::{DirectiveAccumulator, DirectiveScanner};
use crate::{
    BuildError, BuildOptions, BuildPass, BuildPlan, Diagnostic, DiagnosticLevel,
};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Wall-clock instrumentation for one pass.
#[derive(Debug, Clone, Copy)]
pub struct PassTiming {
    pub pass: BuildPass,
    pub started: Instant,
    pub finished: Instant,
}

/// The sealed output of a successful orchestrated build.
#[derive(Debug)]
pub struct BuildReport {
    /// Discovery artifact after the link pass.
    pub server_chunks: Vec<OutputChunk>,
    /// Out-of-band renderer bundle.
    pub render_chunks: Vec<OutputChunk>,
    /// Client bundle.
    pub client_chunks: Vec<OutputChunk>,
    /// Merged asset manifest (client entries take precedence).
    pub manifest: Manifest,
    /// Post-filter client boundary ids, sorted.
    pub client_files: Vec<String>,
    /// Post-filter server boundary ids, sorted.
    pub server_files: Vec<String>,
    pub timings: Vec<PassTiming>,
    pub diagnostics: Vec<Diagnostic>,
}

// ---------------------------------------------------------------------------
// Generated modules
// ---------------------------------------------------------------------------

/// Carrier for the manifest placeholder; part of the server entry set so
/// the discovery artifact holds the token the link pass resolves.
fn generate_manifest_module() -> String {
    format!(
        r#"// Generated manifest carrier, resolved at the link pass.
const manifest = {MANIFEST_PLACEHOLDER};

export default manifest;
"#
    )
}

/// Out-of-band render entry: imports every retained client boundary so the
/// shell renderer can resolve them during markup generation.
fn generate_render_entry(client_files: &[String]) -> String {
    let mut code = String::from("// Generated out-of-band render entry.\n");
    for id in client_files {
        code.push_str(&format!("import \"/{id}\";\n"));
    }
    code.push_str("\nexport { renderShell } from \"meridian/runtime/render\";\n");
    code
}

/// Client bootstrap used when no client-boundary modules survive discovery.
fn generate_default_client_entry() -> String {
    format!(
        r#"// Generated client bootstrap.
const payload = document.getElementById("{PAYLOAD_SCRIPT_ID}");
if (payload) {{
  window.__MERIDIAN_STATE__ = JSON.parse(payload.textContent);
}}
"#
    )
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Removes the pass selector when the sequence ends, on success or abort.
struct PassEnvGuard;

impl Drop for PassEnvGuard {
    fn drop(&mut self) {
        std::env::remove_var(BuildPass::ENV_VAR);
    }
}

pub(crate) async fn execute_build(
    bundler: &dyn ModuleBundler,
    plan: BuildPlan,
    opts: BuildOptions,
) -> Result<BuildReport, BuildError> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut timings: Vec<PassTiming> = Vec::new();

    diagnostics.push(Diagnostic {
        level: DiagnosticLevel::Info,
        message: format!("build started for entry: {}", plan.server_entry),
        context: None,
    });

    // Fresh accumulator per invocation — concurrent builds sharing one are
    // unsupported.
    let acc = DirectiveAccumulator::new();
    let resolver = opts
        .resolver
        .clone()
        .unwrap_or_else(|| Arc::new(FsResolver::new(&plan.root)));
    let scanner =
        DirectiveScanner::new(&plan.root, resolver).with_vendor_dir(opts.vendor_dir.clone());

    let entry_path = plan.root.join(&plan.server_entry);
    let scan_report = scanner.scan(&[entry_path], &opts.server_conditions, &acc)?;
    diagnostics.extend(scan_report.diagnostics);
    diagnostics.push(Diagnostic {
        level: DiagnosticLevel::Info,
        message: format!(
            "scan complete: {} modules, {} client boundaries, {} server boundaries",
            scan_report.records.len(),
            acc.client_files().len(),
            acc.server_files().len(),
        ),
        context: None,
    });

    let _env_guard = PassEnvGuard;

    // Synthetic modules shared by every pass.
    let synthetic = Arc::new(SyntheticModules::new());
    let manifest_specifier = synthetic.insert("client-manifest", generate_manifest_module());

    // Pass 1 — discovery. Full scanned entry set: the server entry plus
    // every directive file, so nothing classifiable is dropped unseen.
    let mut server_entries = vec![
        InputItem::new("server", plan.server_entry.clone()),
        InputItem::new("client-manifest", manifest_specifier),
    ];
    for id in acc.client_files().into_iter().chain(acc.server_files()) {
        server_entries.push(InputItem {
            name: None,
            import: id,
        });
    }

    let discovery = run_pass(
        bundler,
        BuildPass::Discovery,
        BuildRequest {
            root: plan.root.clone(),
            entries: server_entries.clone(),
            conditions: opts.server_conditions.clone(),
            pass: BuildPass::Discovery,
            hooks: vec![BuildHooks::from_synthetic("meridian-synthetic", Arc::clone(&synthetic) as Arc<dyn SyntheticSourceProvider>)],
            artifact: None,
        },
        &mut timings,
    )
    .await?;

    // Filter to modules the discovery bundle actually retained; statically
    // unreachable or eliminated directive files drop out here.
    acc.retain_included(&discovery.included_modules);
    let client_files = acc.client_files();
    let server_files = acc.server_files();
    debug!(
        client = client_files.len(),
        server = server_files.len(),
        "directive set filtered against discovery output"
    );
    diagnostics.push(Diagnostic {
        level: DiagnosticLevel::Info,
        message: format!(
            "discovery complete: {} chunks, {} client / {} server boundaries retained",
            discovery.chunks.len(),
            client_files.len(),
            server_files.len(),
        ),
        context: None,
    });

    // Pass 2 — out-of-band renderer bundle, from the filtered server output.
    let render_specifier = synthetic.insert("render-entry", generate_render_entry(&client_files));
    let render = run_pass(
        bundler,
        BuildPass::RenderBundle,
        BuildRequest {
            root: plan.root.clone(),
            entries: vec![InputItem::new("render", render_specifier)],
            conditions: opts.server_conditions.clone(),
            pass: BuildPass::RenderBundle,
            hooks: vec![BuildHooks::from_synthetic("meridian-synthetic", Arc::clone(&synthetic) as Arc<dyn SyntheticSourceProvider>)],
            artifact: None,
        },
        &mut timings,
    )
    .await?;

    // Pass 3 — client bundle from the filtered client files, or the default
    // entry when none survived.
    let client_entries = if client_files.is_empty() {
        let default_specifier =
            synthetic.insert("default-client-entry", generate_default_client_entry());
        vec![InputItem::new("client", default_specifier)]
    } else {
        client_files
            .iter()
            .map(|id| InputItem {
                name: None,
                import: id.clone(),
            })
            .collect()
    };

    let client = run_pass(
        bundler,
        BuildPass::ClientAssets,
        BuildRequest {
            root: plan.root.clone(),
            entries: client_entries,
            conditions: opts.client_conditions.clone(),
            pass: BuildPass::ClientAssets,
            hooks: vec![BuildHooks::from_synthetic("meridian-synthetic", Arc::clone(&synthetic) as Arc<dyn SyntheticSourceProvider>)],
            artifact: None,
        },
        &mut timings,
    )
    .await?;

    // Manifests are produced per environment bundle and merged here; the
    // client manifest is merged last so its entries win for linking.
    let mut manifest = Manifest::from_chunks(&render.chunks);
    manifest.merge(Manifest::from_chunks(&client.chunks));
    diagnostics.push(Diagnostic {
        level: DiagnosticLevel::Info,
        message: format!("asset manifest ready: {} modules", manifest.len()),
        context: None,
    });

    // Pass 4 — link.
    let linked = run_link_pass(
        bundler,
        &plan,
        server_entries,
        &opts.server_conditions,
        discovery.chunks,
        &manifest,
        &mut timings,
    )
    .await?;

    if opts.write_to_disk {
        let out_dir = plan
            .out_dir
            .clone()
            .unwrap_or_else(|| Path::new("dist").to_path_buf());
        write_outputs(&out_dir, &linked, &render.chunks, &client.chunks, &manifest).await?;
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Info,
            message: format!("written to {}", out_dir.display()),
            context: None,
        });
    }

    info!(
        server_chunks = linked.len(),
        client_chunks = client.chunks.len(),
        "build complete"
    );

    Ok(BuildReport {
        server_chunks: linked,
        render_chunks: render.chunks,
        client_chunks: client.chunks,
        manifest,
        client_files,
        server_files,
        timings,
        diagnostics,
    })
}

/// The link pass, separated so its preconditions fail loud.
///
/// Re-emits the discovery artifact through the engine with the linker's
/// transform hook enabled; the entries are the identical logical entries of
/// pass 1. Leftover placeholders after the pass are a defect.
pub async fn run_link_pass(
    bundler: &dyn ModuleBundler,
    plan: &BuildPlan,
    entries: Vec<InputItem>,
    conditions: &[String],
    artifact: Vec<OutputChunk>,
    manifest: &Manifest,
    timings: &mut Vec<PassTiming>,
) -> Result<Vec<OutputChunk>, BuildError> {
    if artifact.is_empty() {
        return Err(BuildError::Invariant(
            "link pass invoked without the discovery artifact".into(),
        ));
    }
    if manifest.is_empty() {
        return Err(BuildError::Invariant(
            "link pass invoked without a client asset manifest".into(),
        ));
    }

    let linker = Linker::new(manifest, &plan.base)?;
    let linked = run_pass(
        bundler,
        BuildPass::Link,
        BuildRequest {
            root: plan.root.clone(),
            entries,
            conditions: conditions.to_vec(),
            pass: BuildPass::Link,
            hooks: vec![linker.into_hooks()],
            artifact: Some(artifact),
        },
        timings,
    )
    .await?;

    let mut leftovers = Vec::new();
    for chunk in &linked.chunks {
        leftovers.extend(leftover_placeholders(&chunk.code));
    }
    if !leftovers.is_empty() {
        return Err(BuildError::UnresolvedPlaceholders(leftovers));
    }

    Ok(linked.chunks)
}

/// Run one engine invocation with the pass selector exported and the
/// timing recorded. Failures come back annotated with the pass.
async fn run_pass(
    bundler: &dyn ModuleBundler,
    pass: BuildPass,
    request: BuildRequest,
    timings: &mut Vec<PassTiming>,
) -> Result<BuildOutput, BuildError> {
    std::env::set_var(BuildPass::ENV_VAR, pass.name());
    debug!(%pass, "pass started");

    let started = Instant::now();
    let result = bundler.build(request).await;
    let finished = Instant::now();
    timings.push(PassTiming {
        pass,
        started,
        finished,
    });

    result.map_err(|source| BuildError::Pass { pass, source })
}

async fn write_outputs(
    out_dir: &Path,
    server: &[OutputChunk],
    render: &[OutputChunk],
    client: &[OutputChunk],
    manifest: &Manifest,
) -> Result<(), BuildError> {
    for (env, chunks) in [("server", server), ("render", render), ("client", client)] {
        for chunk in chunks {
            let path = out_dir.join(env).join(&chunk.file_name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &chunk.code).await?;
        }
    }

    let manifest_path = out_dir.join("client").join("manifest.json");
    if let Some(parent) = manifest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&manifest_path, manifest.to_json()?).await?;
    Ok(())
}
