//! Signature payload canonicalization
//!
//! A signature covers the semantic identity of a manifest - module
//! hashes, dependencies, entry point, and the set of signing key names -
//! but not mutable transport details (absolute vs. relative URLs) nor
//! the signature values themselves. The canonical payload is derived
//! from the parsed JSON document, never from a re-serialized model, so
//! every verifier reconstructs the exact bytes that were signed.

use serde_json::Value;
use zipline_errors::Error;

/// Derive the canonical signature payload from a parsed manifest value.
///
/// Rules:
/// - for each object under `modules`, if it has a string `url` field,
///   replace its value with the empty string;
/// - replace every value under `signatures` with the empty string;
/// - leave everything else untouched: key order, unknown fields of any
///   JSON type at any nesting, and non-matching shapes.
#[must_use]
pub fn signature_payload(manifest: &Value) -> Value {
    let mut canonical = manifest.clone();

    let Value::Object(root) = &mut canonical else {
        return canonical;
    };

    if let Some(Value::Object(modules)) = root.get_mut("modules") {
        for module in modules.values_mut() {
            if let Value::Object(fields) = module {
                if let Some(url) = fields.get_mut("url") {
                    if url.is_string() {
                        *url = Value::String(String::new());
                    }
                }
            }
        }
    }

    if let Some(Value::Object(signatures)) = root.get_mut("signatures") {
        for signature in signatures.values_mut() {
            *signature = Value::String(String::new());
        }
    }

    canonical
}

/// Serialize a canonical payload without whitespace, for signing and
/// verifying.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_compact(value: &Value) -> Result<String, Error> {
    Ok(serde_json::to_string(value)?)
}

/// Serialize a canonical payload with indentation, for debugging.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_pretty(value: &Value) -> Result<String, Error> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Canonical compact payload bytes of a raw manifest document.
///
/// Verifiers call this on the bytes they fetched, not on a re-serialized
/// model, to avoid any formatter drift.
///
/// # Errors
/// Returns an error if the bytes are not valid JSON.
pub fn payload_bytes(raw_manifest: &[u8]) -> Result<Vec<u8>, Error> {
    let value: Value = serde_json::from_slice(raw_manifest)?;
    Ok(to_compact(&signature_payload(&value))?.into_bytes())
}
