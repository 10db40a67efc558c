//! Manifest Linker — resolves placeholder tokens in a built artifact.
//!
//! The discovery-pass artifact carries two placeholder kinds:
//!
//! - asset references: [`ASSET_PLACEHOLDER_PREFIX`] + an un-hashed
//!   root-relative path, substituted with the hashed path once the client
//!   manifest exists
//! - the manifest itself: [`MANIFEST_PLACEHOLDER`], one quoted literal
//!   replaced with the serialized manifest JSON
//!
//! Linking happens once, at the link pass, and is terminal: re-linking an
//! already-linked artifact is a no-op, and any placeholder surviving the
//! pass is a defect.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::bundler::BuildHooks;
use crate::manifest::Manifest;
use crate::utils;

/// Prefix of an asset-reference placeholder.
pub const ASSET_PLACEHOLDER_PREFIX: &str = "__MERIDIAN_ASSET__";

/// The manifest-JSON placeholder, including its surrounding quotes so the
/// substituted JSON lands as an expression.
pub const MANIFEST_PLACEHOLDER: &str = "\"__MERIDIAN_MANIFEST__\"";

fn asset_pattern() -> Regex {
    Regex::new(&format!(
        r#"{}([^"'`\s)]+)"#,
        regex::escape(ASSET_PLACEHOLDER_PREFIX)
    ))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Linker
// ---------------------------------------------------------------------------

/// Substitutes placeholders against one resolved manifest.
///
/// Constructed once per link pass; the manifest is serialized a single time
/// and every chunk is rewritten against it.
#[derive(Debug)]
pub struct Linker {
    manifest: Manifest,
    manifest_json: String,
    base: String,
}

impl Linker {
    pub fn new(manifest: &Manifest, base: &str) -> serde_json::Result<Self> {
        Ok(Self {
            manifest: manifest.clone(),
            manifest_json: serde_json::to_string(manifest)?,
            base: base.to_string(),
        })
    }

    /// Rewrite one chunk: a single global replace of the manifest
    /// placeholder, then every asset-reference placeholder. Duplicate
    /// occurrences are all substituted; an artifact with no placeholders
    /// passes through unchanged.
    pub fn link_chunk(&self, code: &str) -> String {
        let mut out = code.replace(MANIFEST_PLACEHOLDER, &self.manifest_json);

        if out.contains(ASSET_PLACEHOLDER_PREFIX) {
            out = asset_pattern()
                .replace_all(&out, |caps: &regex::Captures<'_>| {
                    self.resolve_asset(&caps[1])
                })
                .into_owned();
        }
        out
    }

    /// Look up one asset reference. A manifest hit substitutes the
    /// base-prefixed hashed path. A miss is treated as an already-final
    /// static asset — only the placeholder prefix is stripped — but is
    /// logged, since a broken reference looks identical.
    fn resolve_asset(&self, path: &str) -> String {
        let key = path.trim_start_matches('/');
        match self.manifest.get(path).or_else(|| self.manifest.get(key)) {
            Some(info) => utils::join_base(&self.base, &info.file),
            None => {
                warn!(path, "asset reference not in manifest; treating as static asset");
                path.to_string()
            }
        }
    }

    /// Package this linker as the transform hook for the link pass.
    /// Chunks without placeholders are left untouched (`None`).
    pub fn into_hooks(self) -> BuildHooks {
        let linker = Arc::new(self);
        BuildHooks::named("meridian-link").with_transform(Box::new(move |_id: &str, code: &str| {
            if code.contains(ASSET_PLACEHOLDER_PREFIX) || code.contains(MANIFEST_PLACEHOLDER) {
                Ok(Some(linker.link_chunk(code)))
            } else {
                Ok(None)
            }
        }))
    }
}

/// Placeholder occurrences still present in a chunk. Non-empty output after
/// the link pass is a defect.
pub fn leftover_placeholders(code: &str) -> Vec<String> {
    let mut leftovers: Vec<String> = asset_pattern()
        .find_iter(code)
        .map(|m| m.as_str().to_string())
        .collect();
    if code.contains(MANIFEST_PLACEHOLDER) {
        leftovers.push(MANIFEST_PLACEHOLDER.to_string());
    }
    leftovers
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ChunkInfo;
    use pretty_assertions::assert_eq;

    fn manifest_with(module: &str, file: &str) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.insert(
            module,
            ChunkInfo {
                file: file.into(),
                ..Default::default()
            },
        );
        manifest
    }

    #[test]
    fn asset_roundtrip() {
        let manifest = manifest_with("P", "P.abc123.js");
        let linker = Linker::new(&manifest, "").unwrap();
        let artifact = format!(r#"const src = "{ASSET_PLACEHOLDER_PREFIX}P";"#);

        let linked = linker.link_chunk(&artifact);
        assert_eq!(linked, r#"const src = "P.abc123.js";"#);
        assert!(leftover_placeholders(&linked).is_empty());
    }

    #[test]
    fn asset_base_prefixed() {
        let manifest = manifest_with("src/logo.svg", "assets/logo.1a2b.svg");
        let linker = Linker::new(&manifest, "/app").unwrap();
        let artifact = format!(r#"load("{ASSET_PLACEHOLDER_PREFIX}/src/logo.svg")"#);

        assert_eq!(
            linker.link_chunk(&artifact),
            r#"load("/app/assets/logo.1a2b.svg")"#
        );
    }

    #[test]
    fn manifest_miss_strips_prefix_only() {
        let manifest = Manifest::new();
        let linker = Linker::new(&manifest, "/").unwrap();
        let artifact = format!(r#"fetch("{ASSET_PLACEHOLDER_PREFIX}/public/robots.txt")"#);

        assert_eq!(linker.link_chunk(&artifact), r#"fetch("/public/robots.txt")"#);
    }

    #[test]
    fn duplicate_occurrences_all_substituted() {
        let manifest = manifest_with("a.js", "a.hash.js");
        let linker = Linker::new(&manifest, "").unwrap();
        let artifact = format!(
            r#"["{p}a.js", "{p}a.js"]"#,
            p = ASSET_PLACEHOLDER_PREFIX
        );

        let linked = linker.link_chunk(&artifact);
        assert_eq!(linked, r#"["a.hash.js", "a.hash.js"]"#);
    }

    #[test]
    fn manifest_placeholder_global_replace() {
        let manifest = manifest_with("m.js", "m.hash.js");
        let linker = Linker::new(&manifest, "/").unwrap();
        let artifact = format!("const manifest = {MANIFEST_PLACEHOLDER};");

        let linked = linker.link_chunk(&artifact);
        assert!(linked.contains(r#"{"m.js":{"file":"m.hash.js"}}"#));
        assert!(leftover_placeholders(&linked).is_empty());
    }

    #[test]
    fn relink_is_noop() {
        let manifest = manifest_with("P", "P.abc123.js");
        let linker = Linker::new(&manifest, "").unwrap();
        let artifact = format!(r#"const src = "{ASSET_PLACEHOLDER_PREFIX}P";"#);

        let once = linker.link_chunk(&artifact);
        let twice = linker.link_chunk(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn transform_hook_skips_clean_chunks() {
        let manifest = manifest_with("P", "P.abc123.js");
        let hooks = Linker::new(&manifest, "").unwrap().into_hooks();
        let transform = hooks.transform.as_ref().unwrap();

        assert!(transform("chunk.js", "no placeholders here")
            .unwrap()
            .is_none());
        let rewritten = transform(
            "chunk.js",
            &format!(r#""{ASSET_PLACEHOLDER_PREFIX}P""#),
        )
        .unwrap()
        .unwrap();
        assert_eq!(rewritten, r#""P.abc123.js""#);
    }

    #[test]
    fn leftover_detection() {
        let dirty = format!("x = \"{ASSET_PLACEHOLDER_PREFIX}gone.js\"; y = {MANIFEST_PLACEHOLDER};");
        let leftovers = leftover_placeholders(&dirty);
        assert_eq!(leftovers.len(), 2);
    }
}
