//! Directive Scanner — classifies modules by boundary directive.
//!
//! Walks the module graph depth-first from the entry points, reading each
//! file once and classifying it by its leading `"use client"` /
//! `"use server"` directive. Classifications accumulate into a
//! [`DirectiveAccumulator`] passed by reference through the call chain; the
//! orchestrator later filters the accumulator down to modules the discovery
//! bundle actually retained.
//!
//! Import edges come from a lexical scan, not a parser: the bundler owns
//! real resolution, and this pass only needs reachability. Vendor packages
//! are classified by a bulk per-package walk instead of recursing into
//! their dependency closures.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::bundler::ModuleResolver;
use crate::utils;
use crate::{BuildError, Diagnostic, DiagnosticLevel};

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

pub const CLIENT_DIRECTIVE: &str = "use client";
pub const SERVER_DIRECTIVE: &str = "use server";

/// Boundary directive kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Client,
    Server,
}

/// Classify a module source by its leading directive.
///
/// The directive must be the first statement: a string literal before any
/// other code, with only comments, whitespace, or a hashbang ahead of it.
/// Directives after other statements are not boundaries.
pub fn leading_directive(source: &str) -> Option<Directive> {
    let rest = skip_leading_trivia(source);
    let mut chars = rest.chars();
    let quote = match chars.next() {
        Some(c @ ('"' | '\'')) => c,
        _ => return None,
    };
    let rest = chars.as_str();
    let end = rest.find(quote)?;
    let literal = &rest[..end];

    // The literal must terminate the statement.
    let after = rest[end + quote.len_utf8()..].trim_start_matches([' ', '\t']);
    if !(after.is_empty() || after.starts_with(';') || after.starts_with('\n') || after.starts_with('\r'))
    {
        return None;
    }

    match literal {
        CLIENT_DIRECTIVE => Some(Directive::Client),
        SERVER_DIRECTIVE => Some(Directive::Server),
        _ => None,
    }
}

/// Skip whitespace, `//` and `/* */` comments, and a leading hashbang.
fn skip_leading_trivia(source: &str) -> &str {
    let mut rest = source;
    if let Some(after) = rest.strip_prefix("#!") {
        rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
    }
    loop {
        let trimmed = rest.trim_start();
        if let Some(after) = trimmed.strip_prefix("//") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            match after.split_once("*/") {
                Some((_, tail)) => rest = tail,
                None => return "",
            }
        } else {
            return trimmed;
        }
    }
}

// ---------------------------------------------------------------------------
// Import edges
// ---------------------------------------------------------------------------

/// One import discovered in a module's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEdge {
    pub specifier: String,
    pub dynamic: bool,
}

/// Lexically collect static and dynamic import specifiers, in source order.
pub fn collect_import_edges(source: &str) -> Vec<ImportEdge> {
    let static_from =
        Regex::new(r#"(?m)^\s*(?:import|export)\b[^'"\n]*?\bfrom\s*['"]([^'"]+)['"]"#).unwrap();
    let side_effect = Regex::new(r#"(?m)^\s*import\s*['"]([^'"]+)['"]"#).unwrap();
    let dynamic = Regex::new(r#"import\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap();

    let mut edges: Vec<ImportEdge> = Vec::new();
    let mut seen = HashSet::new();
    let mut add = |specifier: &str, dynamic: bool| {
        if seen.insert((specifier.to_string(), dynamic)) {
            edges.push(ImportEdge {
                specifier: specifier.to_string(),
                dynamic,
            });
        }
    };

    for cap in static_from.captures_iter(source) {
        add(&cap[1], false);
    }
    for cap in side_effect.captures_iter(source) {
        add(&cap[1], false);
    }
    for cap in dynamic.captures_iter(source) {
        add(&cap[1], true);
    }
    edges
}

// ---------------------------------------------------------------------------
// ModuleRecord
// ---------------------------------------------------------------------------

/// Environment labels attached to module records.
pub const SERVER_ENV: &str = "server";
pub const CLIENT_ENV: &str = "client";

/// Scan result for one reachable module.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// Normalized root-relative id.
    pub id: String,
    /// Absolute path on disk.
    pub path: PathBuf,
    pub directive: Option<Directive>,
    /// Environments that can reach this module. Every scanned module is
    /// server-reachable; modules at or behind a client boundary are
    /// client-reachable too.
    pub environments: BTreeSet<String>,
    /// Reached only through a deferred dynamic edge.
    pub via_dynamic: bool,
    pub edges: Vec<ImportEdge>,
}

/// Full report of one scan invocation.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub records: Vec<ModuleRecord>,
    pub diagnostics: Vec<Diagnostic>,
    /// Vendor packages classified through the bulk lookup.
    pub vendor_packages: usize,
}

// ---------------------------------------------------------------------------
// DirectiveAccumulator
// ---------------------------------------------------------------------------

/// The cross-call accumulator of boundary classifications.
///
/// Mutated by exactly one build invocation at a time; a new invocation
/// starts from a fresh, empty accumulator. Concurrent-map backed so bundler
/// hooks running on other tasks can add members; read out through sorted
/// views for determinism.
#[derive(Debug, Default)]
pub struct DirectiveAccumulator {
    client_files: DashMap<String, ()>,
    server_files: DashMap<String, ()>,
}

impl DirectiveAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, directive: Directive, module_id: impl Into<String>) {
        match directive {
            Directive::Client => self.client_files.insert(module_id.into(), ()),
            Directive::Server => self.server_files.insert(module_id.into(), ()),
        };
    }

    /// Sorted client-boundary module ids.
    pub fn client_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.client_files.iter().map(|e| e.key().clone()).collect();
        files.sort();
        files
    }

    /// Sorted server-boundary module ids.
    pub fn server_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.server_files.iter().map(|e| e.key().clone()).collect();
        files.sort();
        files
    }

    /// Drop members the built output did not retain. After this, every
    /// member is provably present in the bundle.
    pub fn retain_included(&self, included: &HashSet<String>) {
        self.client_files.retain(|id, _| included.contains(id));
        self.server_files.retain(|id, _| included.contains(id));
    }

    pub fn is_empty(&self) -> bool {
        self.client_files.is_empty() && self.server_files.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Per-package result of the bulk vendor lookup.
#[derive(Debug, Clone, Default)]
struct VendorScan {
    client: Vec<String>,
    server: Vec<String>,
}

const VENDOR_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];

/// The directive scanner. Idempotent and safe to re-run, but not
/// incremental — re-run it after source changes that could alter
/// reachability.
pub struct DirectiveScanner {
    root: PathBuf,
    resolver: Arc<dyn ModuleResolver>,
    vendor_dir: String,
    vendor_cache: DashMap<String, VendorScan>,
}

impl std::fmt::Debug for DirectiveScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectiveScanner")
            .field("root", &self.root)
            .field("vendor_dir", &self.vendor_dir)
            .finish()
    }
}

struct ScanState<'a> {
    conditions: &'a [String],
    acc: &'a DirectiveAccumulator,
    visited: HashSet<PathBuf>,
    /// Record index per path, so a re-encounter under another environment
    /// context still widens that record's reach.
    index: HashMap<PathBuf, usize>,
    /// Dynamic edges deferred until static traversal completes, with the
    /// environment context they were discovered under.
    deferred: Vec<(PathBuf, bool)>,
    report: ScanReport,
}

impl DirectiveScanner {
    pub fn new(root: impl Into<PathBuf>, resolver: Arc<dyn ModuleResolver>) -> Self {
        Self {
            root: root.into(),
            resolver,
            vendor_dir: "node_modules".into(),
            vendor_cache: DashMap::new(),
        }
    }

    pub fn with_vendor_dir(mut self, dir: impl Into<String>) -> Self {
        self.vendor_dir = dir.into();
        self
    }

    /// Scan from the entry points under one environment's condition
    /// ordering, accumulating classifications into `acc`.
    ///
    /// Unreadable non-entry modules are skipped with a warning; an
    /// unreadable entry aborts the scan.
    pub fn scan(
        &self,
        entries: &[PathBuf],
        conditions: &[String],
        acc: &DirectiveAccumulator,
    ) -> Result<ScanReport, BuildError> {
        let mut state = ScanState {
            conditions,
            acc,
            visited: HashSet::new(),
            index: HashMap::new(),
            deferred: Vec::new(),
            report: ScanReport::default(),
        };

        for entry in entries {
            self.scan_module(entry, true, false, false, &mut state)?;
        }

        // Deferred dynamic edges: walked only after static traversal, so a
        // dynamic-only module is still classified but marked as such.
        while let Some((target, client_context)) = state.deferred.pop() {
            self.scan_module(&target, false, true, client_context, &mut state)?;
        }

        debug!(
            modules = state.report.records.len(),
            vendor_packages = state.report.vendor_packages,
            "directive scan complete"
        );
        Ok(state.report)
    }

    fn scan_module(
        &self,
        path: &Path,
        is_entry: bool,
        via_dynamic: bool,
        client_context: bool,
        state: &mut ScanState<'_>,
    ) -> Result<(), BuildError> {
        let normalized = path.to_path_buf();
        if !state.visited.insert(normalized.clone()) {
            // Re-encountered under a wider environment context.
            if client_context {
                if let Some(&at) = state.index.get(&normalized) {
                    state.report.records[at]
                        .environments
                        .insert(CLIENT_ENV.to_string());
                }
            }
            return Ok(());
        }

        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(source) if is_entry => {
                return Err(BuildError::EntryUnreadable {
                    path: normalized,
                    source,
                });
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable module");
                state.report.diagnostics.push(Diagnostic {
                    level: DiagnosticLevel::Warning,
                    message: format!("skipping unreadable module: {}", path.display()),
                    context: Some(err.to_string()),
                });
                return Ok(());
            }
        };

        let id = utils::normalize_module_id(&self.root, path);
        let directive = leading_directive(&source);
        if let Some(directive) = directive {
            state.acc.add(directive, id.clone());
        }

        // Crossing a client boundary puts the whole subtree in client reach.
        let in_client = client_context || directive == Some(Directive::Client);
        let mut environments = BTreeSet::from([SERVER_ENV.to_string()]);
        if in_client {
            environments.insert(CLIENT_ENV.to_string());
        }

        let edges = collect_import_edges(&source);
        state.index.insert(normalized.clone(), state.report.records.len());
        state.report.records.push(ModuleRecord {
            id,
            path: normalized.clone(),
            directive,
            environments,
            via_dynamic,
            edges: edges.clone(),
        });

        for edge in edges {
            let specifier = utils::strip_query(&edge.specifier);
            if utils::is_bare_specifier(specifier) {
                self.scan_vendor_package(specifier, state);
                continue;
            }
            match self.resolver.resolve(specifier, &normalized, state.conditions) {
                Ok(Some(target)) => {
                    if edge.dynamic {
                        state.deferred.push((target, in_client));
                    } else {
                        self.scan_module(&target, false, via_dynamic, in_client, state)?;
                    }
                }
                Ok(None) => {
                    warn!(
                        specifier,
                        importer = %path.display(),
                        "unresolved import; skipping edge"
                    );
                }
                Err(err) => {
                    warn!(
                        specifier,
                        importer = %path.display(),
                        error = %err,
                        "resolver failed; skipping edge"
                    );
                    state.report.diagnostics.push(Diagnostic {
                        level: DiagnosticLevel::Warning,
                        message: format!("resolver failed for `{specifier}`"),
                        context: Some(err.to_string()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Bulk vendor lookup: classify every shipped source file of the
    /// package in place, without recursing into its dependency closure.
    /// Results are cached per package name.
    fn scan_vendor_package(&self, specifier: &str, state: &mut ScanState<'_>) {
        let package = utils::package_name(specifier).to_string();
        if let Some(cached) = self.vendor_cache.get(&package) {
            self.apply_vendor_scan(&cached, state.acc);
            return;
        }

        let package_dir = self.root.join(&self.vendor_dir).join(&package);
        if !package_dir.is_dir() {
            debug!(package = %package, "vendor package not present; leaving to the bundler");
            self.vendor_cache.insert(package, VendorScan::default());
            return;
        }

        let mut scan = VendorScan::default();
        for entry in WalkDir::new(&package_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let ext = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !VENDOR_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let source = match std::fs::read_to_string(entry.path()) {
                Ok(source) => source,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping unreadable vendor file");
                    continue;
                }
            };
            let id = utils::normalize_module_id(&self.root, entry.path());
            match leading_directive(&source) {
                Some(Directive::Client) => scan.client.push(id),
                Some(Directive::Server) => scan.server.push(id),
                None => {}
            }
        }

        state.report.vendor_packages += 1;
        self.apply_vendor_scan(&scan, state.acc);
        self.vendor_cache.insert(package, scan);
    }

    fn apply_vendor_scan(&self, scan: &VendorScan, acc: &DirectiveAccumulator) {
        for id in &scan.client {
            acc.add(Directive::Client, id.clone());
        }
        for id in &scan.server {
            acc.add(Directive::Server, id.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
