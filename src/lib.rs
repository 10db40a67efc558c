//! # Meridian Core
//!
//! Boundary-aware build orchestration and streaming render assembly for the
//! Meridian Framework.
//!
//! Source files declare, per module, whether they run on the server only or
//! must also ship to the client (`"use client"` / `"use server"` boundary
//! directives). This crate classifies the module graph, sequences the
//! bundler passes that resolve the server/client circular dependency, links
//! hashed asset names back into the server artifact, and — at request time —
//! merges the payload, shell, and template streams into one ordered
//! response.
//!
//! The bundler itself is an external collaborator: this crate drives it
//! through the [`bundler::ModuleBundler`] trait and never parses or
//! resolves modules beyond the lexical scan the directive classifier needs.

pub mod bundler;
pub mod link;
pub mod manifest;
pub mod orchestrate;
pub mod render;
pub mod scan;
pub mod stream;
pub mod utils;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bundler::{
    BuildHooks, BuildOutput, BuildRequest, BundlerError, FsResolver, InputItem, ModuleBundler,
    ModuleResolver, OutputChunk, SyntheticModules, SyntheticSourceProvider,
};
pub use link::Linker;
pub use manifest::{ChunkInfo, Manifest};
pub use orchestrate::{BuildReport, PassTiming};
pub use render::{assemble_response, AssemblyOptions, ComponentTree, PayloadRenderer, ShellRenderer};
pub use scan::{Directive, DirectiveAccumulator, DirectiveScanner};
pub use stream::{ByteStream, StreamError};

// ---------------------------------------------------------------------------
// Build Pass
// ---------------------------------------------------------------------------

/// One of the four strictly ordered orchestrator stages.
///
/// The executing pass is exported through [`BuildPass::ENV_VAR`] for the
/// duration of its bundler invocation so hooked build steps can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuildPass {
    /// Server-side bundle from the full scanned entry set; its inclusion
    /// report filters the directive accumulator.
    Discovery,
    /// Out-of-band renderer bundle, built from the filtered server output.
    RenderBundle,
    /// Client bundle from the filtered client-file set; emits the asset
    /// manifest.
    ClientAssets,
    /// Re-link of the discovery artifact with placeholders substituted.
    Link,
}

impl BuildPass {
    /// Out-of-band pass selector read by hooked build steps.
    pub const ENV_VAR: &'static str = "MERIDIAN_BUILD_PASS";

    /// Stable name used as the env var value.
    pub fn name(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::RenderBundle => "render",
            Self::ClientAssets => "client",
            Self::Link => "link",
        }
    }

    /// 1-based pass number used in error annotations.
    pub fn number(self) -> u8 {
        match self {
            Self::Discovery => 1,
            Self::RenderBundle => 2,
            Self::ClientAssets => 3,
            Self::Link => 4,
        }
    }

    /// Read the selector back from the environment.
    pub fn from_env() -> Option<Self> {
        match std::env::var(Self::ENV_VAR).ok()?.as_str() {
            "discovery" => Some(Self::Discovery),
            "render" => Some(Self::RenderBundle),
            "client" => Some(Self::ClientAssets),
            "link" => Some(Self::Link),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic accumulated during a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// BuildPlan
// ---------------------------------------------------------------------------

/// Describes WHAT to build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Project root directory.
    pub root: PathBuf,
    /// Root-relative path of the server entry module.
    pub server_entry: String,
    /// Output directory. Defaults to `dist/`.
    pub out_dir: Option<PathBuf>,
    /// Public base path prefixed onto hashed asset references.
    pub base: String,
}

impl BuildPlan {
    pub fn new(root: impl Into<PathBuf>, server_entry: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            server_entry: server_entry.into(),
            out_dir: None,
            base: "/".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// BuildOptions
// ---------------------------------------------------------------------------

/// Describes HOW to build.
pub struct BuildOptions {
    /// Resolution-condition ordering for the server environment.
    pub server_conditions: Vec<String>,
    /// Resolution-condition ordering for the client environment.
    pub client_conditions: Vec<String>,
    /// Vendor package directory name, relative to the root.
    pub vendor_dir: String,
    /// Module resolver consumed by the directive scanner. Defaults to the
    /// in-crate filesystem resolver.
    pub resolver: Option<std::sync::Arc<dyn ModuleResolver>>,
    /// Whether to write the linked artifact and manifest to disk.
    pub write_to_disk: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            server_conditions: vec!["server".into(), "import".into(), "default".into()],
            client_conditions: vec!["browser".into(), "import".into(), "default".into()],
            vendor_dir: "node_modules".into(),
            resolver: None,
            write_to_disk: false,
        }
    }
}

impl std::fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOptions")
            .field("server_conditions", &self.server_conditions)
            .field("client_conditions", &self.client_conditions)
            .field("vendor_dir", &self.vendor_dir)
            .field("write_to_disk", &self.write_to_disk)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BuildError
// ---------------------------------------------------------------------------

/// Errors that abort an orchestrated build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("entry module unreadable: {path}: {source}")]
    EntryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bundler pass failed. The underlying diagnostic is surfaced
    /// verbatim, annotated with the pass that produced it. No retry;
    /// restart begins at pass 1.
    #[error("pass {pass} failed: {source}")]
    Pass {
        pass: BuildPass,
        #[source]
        source: BundlerError,
    },

    /// Cross-pass invariant violation — a programming error, not an input
    /// error. Fails loud and fast.
    #[error("build invariant violated: {0}")]
    Invariant(String),

    /// Placeholder tokens survived the link pass.
    #[error("unresolved placeholders remain after link pass: {0:?}")]
    UnresolvedPlaceholders(Vec<String>),

    #[error("manifest serialization failed: {0}")]
    ManifestJson(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run the full four-pass build for a project.
///
/// **There is only one build codepath.** Every build runs the same strictly
/// ordered sequence:
///
/// 1. Discovery pass — server bundle, filters the directive accumulator
/// 2. Secondary-render pass — out-of-band renderer bundle
/// 3. Client-asset pass — client bundle, emits the asset manifest
/// 4. Link pass — re-links the discovery artifact with real asset names
///
/// Any pass failing aborts the whole sequence with the pass number attached.
pub async fn build_project(
    bundler: &dyn ModuleBundler,
    plan: BuildPlan,
    opts: BuildOptions,
) -> Result<BuildReport, BuildError> {
    orchestrate::execute_build(bundler, plan, opts).await
}
