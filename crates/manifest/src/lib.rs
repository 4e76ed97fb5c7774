#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Manifest handling for the zipline loader
//!
//! A manifest is a JSON document describing an application version: its
//! modules, their content hashes and dependencies, its entry point, and
//! its signatures. Unknown fields are tolerated and preserved on
//! round-trip so that newer producers can ship fields older loaders do
//! not understand.

mod graph;
pub mod payload;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zipline_errors::{Error, ManifestError};
use zipline_hash::Sha256Digest;

/// File name suffix for a downloaded or embedded manifest
pub const MANIFEST_FILE_SUFFIX: &str = ".manifest.zipline.json";

/// File name of the manifest for an application in a bundle directory
#[must_use]
pub fn manifest_file_name(app_name: &str) -> String {
    format!("{app_name}{MANIFEST_FILE_SUFFIX}")
}

/// An application manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Modules keyed by id, in producer order
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub modules: IndexMap<String, Module>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_module_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_function: Option<String>,

    /// Signatures keyed by signing key name, in producer order
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub signatures: IndexMap<String, String>,

    /// Unknown top-level fields, preserved on round-trip
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, Value>,
}

/// A single code module within a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Where to fetch the module, possibly relative to the manifest URL
    pub url: String,

    /// Content hash of the module bytes
    pub sha256: Sha256Digest,

    /// Ids of modules that must be received before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on_ids: Vec<String>,

    /// Unknown module fields, preserved on round-trip
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, Value>,
}

impl Manifest {
    /// Parse a manifest from its raw JSON bytes
    ///
    /// # Errors
    /// Returns `ManifestError::ParseFailed` if the bytes are not valid
    /// JSON or do not match the manifest shape.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| {
            ManifestError::ParseFailed {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Serialize this manifest back to JSON bytes
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Validate the dependency graph: every `dependsOnIds` entry must
    /// name a module in this manifest, and the graph must be acyclic.
    ///
    /// # Errors
    /// Returns `ManifestError::MissingDependency` or
    /// `ManifestError::CycleDetected`.
    pub fn validate(&self) -> Result<(), Error> {
        graph::validate(self)
    }

    /// Content identity of this manifest, independent of module URLs
    /// and signature values.
    ///
    /// Two manifests describing the same build served from different
    /// hosts hash identically. This is the pin identity in the cache and
    /// the dedup key for continuous loading.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be re-serialized.
    pub fn content_hash(&self) -> Result<Sha256Digest, Error> {
        let value = serde_json::to_value(self)?;
        let canonical = payload::signature_payload(&value);
        Ok(Sha256Digest::digest(payload::to_compact(&canonical)?.as_bytes()))
    }

    /// Hashes of every module in this manifest, in module order
    #[must_use]
    pub fn module_hashes(&self) -> Vec<Sha256Digest> {
        self.modules.values().map(|m| m.sha256).collect()
    }
}
