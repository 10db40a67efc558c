//! External bundler interface.
//!
//! The bundler engine is an out-of-scope collaborator: this crate hands it
//! entries, conditions, and hook records, and consumes its chunk graph and
//! inclusion report. Hooks are plain capability records — structs of named
//! callback fields composed by explicit ordering in the orchestrator, not a
//! trait hierarchy.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::utils;
use crate::BuildPass;

// ---------------------------------------------------------------------------
// Request / output types
// ---------------------------------------------------------------------------

/// One bundle entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputItem {
    /// Stable chunk name; drives emitted file naming.
    pub name: Option<String>,
    /// Module specifier (root-relative path or synthetic id).
    pub import: String,
}

impl InputItem {
    pub fn new(name: impl Into<String>, import: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            import: import.into(),
        }
    }
}

/// A build request handed to the engine for one orchestrator pass.
///
/// When `artifact` is set (link pass), the engine re-emits those chunks —
/// applying each hook record's `transform` in order — instead of rebuilding
/// from source. The entries still name the identical logical entry module.
pub struct BuildRequest {
    pub root: PathBuf,
    pub entries: Vec<InputItem>,
    /// Module-resolution condition ordering for the target environment.
    pub conditions: Vec<String>,
    pub pass: BuildPass,
    /// Hook records, applied in order.
    pub hooks: Vec<BuildHooks>,
    /// Pass-1 artifact to re-emit instead of building from source.
    pub artifact: Option<Vec<OutputChunk>>,
}

impl fmt::Debug for BuildRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildRequest")
            .field("root", &self.root)
            .field("entries", &self.entries)
            .field("conditions", &self.conditions)
            .field("pass", &self.pass)
            .field("hooks", &self.hooks.len())
            .field("artifact", &self.artifact.as_ref().map(Vec::len))
            .finish()
    }
}

/// One emitted output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub file_name: String,
    pub code: String,
    pub is_entry: bool,
    pub is_dynamic_entry: bool,
    /// Normalized ids of the source modules folded into this chunk.
    pub modules: Vec<String>,
    /// CSS assets associated with this chunk.
    pub css: Vec<String>,
    /// File names of statically imported sibling chunks.
    pub imports: Vec<String>,
}

/// The engine's sealed output for one pass.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub chunks: Vec<OutputChunk>,
    /// Modules retained in the final output after dead-code elimination.
    pub included_modules: HashSet<String>,
}

impl BuildOutput {
    /// The per-module "included in final output" query.
    pub fn includes(&self, module_id: &str) -> bool {
        self.included_modules.contains(module_id)
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum BundlerError {
    #[error("bundler failed: {0}")]
    Engine(String),

    #[error("hook failed: {0}")]
    Hook(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The external bundler engine.
#[async_trait]
pub trait ModuleBundler: Send + Sync {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutput, BundlerError>;
}

// ---------------------------------------------------------------------------
// Hook capability records
// ---------------------------------------------------------------------------

pub type ResolveFn =
    Box<dyn Fn(&str, Option<&str>) -> anyhow::Result<Option<String>> + Send + Sync>;
pub type LoadFn = Box<dyn Fn(&str) -> anyhow::Result<Option<String>> + Send + Sync>;
pub type TransformFn = Box<dyn Fn(&str, &str) -> anyhow::Result<Option<String>> + Send + Sync>;

/// A plain capability record of bundler hooks.
///
/// Every field is optional; the engine calls whichever are present:
/// - `resolve(specifier, importer)` — claim a specifier as a module id
/// - `load(id)` — supply source text for a claimed id
/// - `transform(id, code)` — rewrite module or chunk text
pub struct BuildHooks {
    pub name: String,
    pub resolve: Option<ResolveFn>,
    pub load: Option<LoadFn>,
    pub transform: Option<TransformFn>,
}

impl BuildHooks {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resolve: None,
            load: None,
            transform: None,
        }
    }

    pub fn with_resolve(mut self, hook: ResolveFn) -> Self {
        self.resolve = Some(hook);
        self
    }

    pub fn with_load(mut self, hook: LoadFn) -> Self {
        self.load = Some(hook);
        self
    }

    pub fn with_transform(mut self, hook: TransformFn) -> Self {
        self.transform = Some(hook);
        self
    }

    /// Adapt a synthetic-source provider into a resolve/load record.
    pub fn from_synthetic(name: impl Into<String>, provider: Arc<dyn SyntheticSourceProvider>) -> Self {
        let resolve_provider = Arc::clone(&provider);
        Self::named(name)
            .with_resolve(Box::new(move |specifier: &str, _importer: Option<&str>| {
                Ok(resolve_provider.resolve(specifier))
            }))
            .with_load(Box::new(move |id: &str| Ok(provider.load(id))))
    }
}

impl fmt::Debug for BuildHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildHooks")
            .field("name", &self.name)
            .field("resolve", &self.resolve.is_some())
            .field("load", &self.load.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Synthetic sources
// ---------------------------------------------------------------------------

/// Prefix for canonical synthetic module ids.
/// The `\0` prefix prevents filesystem resolution collisions.
pub const SYNTHETIC_PREFIX: &str = "\0meridian:";

/// Public specifier prefix under which synthetic modules are importable.
pub const SYNTHETIC_SPECIFIER_PREFIX: &str = "virtual:meridian:";

/// Provider of in-memory modules synthesized from generated text.
pub trait SyntheticSourceProvider: Send + Sync {
    /// Claim a specifier, returning its canonical id.
    fn resolve(&self, specifier: &str) -> Option<String>;
    /// Source text for a canonical id.
    fn load(&self, canonical_id: &str) -> Option<String>;
}

/// Map-backed [`SyntheticSourceProvider`].
#[derive(Debug, Default)]
pub struct SyntheticModules {
    modules: DashMap<String, String>,
}

impl SyntheticModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under its short name; returns the public specifier.
    pub fn insert(&self, name: &str, source: impl Into<String>) -> String {
        self.modules.insert(name.to_string(), source.into());
        format!("{SYNTHETIC_SPECIFIER_PREFIX}{name}")
    }
}

impl SyntheticSourceProvider for SyntheticModules {
    fn resolve(&self, specifier: &str) -> Option<String> {
        if let Some(name) = specifier.strip_prefix(SYNTHETIC_SPECIFIER_PREFIX) {
            if self.modules.contains_key(name) {
                return Some(format!("{SYNTHETIC_PREFIX}{name}"));
            }
        }
        if specifier.starts_with(SYNTHETIC_PREFIX) {
            return Some(specifier.to_string());
        }
        None
    }

    fn load(&self, canonical_id: &str) -> Option<String> {
        let name = canonical_id.strip_prefix(SYNTHETIC_PREFIX)?;
        self.modules.get(name).map(|entry| entry.value().clone())
    }
}

// ---------------------------------------------------------------------------
// Module resolver
// ---------------------------------------------------------------------------

/// Resolves an import specifier to a canonical path, honoring the
/// environment's condition ordering. Consumed by the directive scanner.
pub trait ModuleResolver: Send + Sync {
    fn resolve(
        &self,
        specifier: &str,
        importer: &Path,
        conditions: &[String],
    ) -> anyhow::Result<Option<PathBuf>>;
}

/// Filesystem resolver for relative and root-absolute specifiers.
///
/// Bare (vendor) specifiers return `None` — vendor packages go through the
/// scanner's bulk lookup instead. Conditions select between per-environment
/// file variants (`mod.server.js` beats `mod.js` when `server` is listed).
#[derive(Debug, Clone)]
pub struct FsResolver {
    root: PathBuf,
}

const RESOLVE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs"];

impl FsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn try_file(base: &Path, conditions: &[String]) -> Option<PathBuf> {
        if base.is_file() {
            return Some(base.to_path_buf());
        }
        let stem = base.to_string_lossy().into_owned();
        for condition in conditions {
            for ext in RESOLVE_EXTENSIONS {
                let candidate = PathBuf::from(format!("{stem}.{condition}.{ext}"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        for ext in RESOLVE_EXTENSIONS {
            let candidate = PathBuf::from(format!("{stem}.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        for ext in RESOLVE_EXTENSIONS {
            let candidate = base.join(format!("index.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

impl ModuleResolver for FsResolver {
    fn resolve(
        &self,
        specifier: &str,
        importer: &Path,
        conditions: &[String],
    ) -> anyhow::Result<Option<PathBuf>> {
        let specifier = utils::strip_query(specifier);
        if utils::is_bare_specifier(specifier) {
            return Ok(None);
        }

        let base = if let Some(rooted) = specifier.strip_prefix('/') {
            self.root.join(rooted)
        } else {
            importer
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(specifier)
        };

        Ok(Self::try_file(&base, conditions))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
