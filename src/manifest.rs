//! Asset manifest — the mapping from source module identity to emitted
//! chunk metadata.
//!
//! One manifest is produced per environment bundle; the orchestrator merges
//! them before the link pass. Keys are normalized root-relative module ids;
//! key order is deterministic so two builds of the same tree serialize to
//! identical bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bundler::OutputChunk;

// ---------------------------------------------------------------------------
// ChunkInfo
// ---------------------------------------------------------------------------

/// Emitted-chunk metadata for one source module.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    /// Emitted (hashed) file name.
    pub file: String,
    /// CSS assets associated with the chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub css: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_entry: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_dynamic_entry: bool,
    /// Ids of statically imported sibling chunks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Mapping module-id → [`ChunkInfo`] for one or more environment bundles.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ChunkInfo>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from a bundle's emitted chunks. Every source module
    /// of a chunk maps to that chunk's metadata.
    pub fn from_chunks(chunks: &[OutputChunk]) -> Self {
        let mut manifest = Self::new();
        for chunk in chunks {
            for module in &chunk.modules {
                manifest.insert(
                    module.clone(),
                    ChunkInfo {
                        file: chunk.file_name.clone(),
                        css: chunk.css.clone(),
                        is_entry: chunk.is_entry,
                        is_dynamic_entry: chunk.is_dynamic_entry,
                        imports: chunk.imports.clone(),
                    },
                );
            }
        }
        manifest
    }

    pub fn insert(&mut self, module_id: impl Into<String>, info: ChunkInfo) {
        self.entries.insert(module_id.into(), info);
    }

    pub fn get(&self, module_id: &str) -> Option<&ChunkInfo> {
        self.entries.get(module_id)
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.entries.contains_key(module_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChunkInfo)> {
        self.entries.iter()
    }

    /// Merge another environment's manifest into this one. On duplicate
    /// module ids the incoming entry wins, so merge order encodes
    /// precedence (the orchestrator merges the client manifest last).
    pub fn merge(&mut self, other: Manifest) {
        self.entries.extend(other.entries);
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
