#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Manifest signing and verification
//!
//! Signatures cover the canonical signature payload of a manifest: the
//! document with module URLs and signature values blanked. The verifier
//! always recomputes the payload from the raw bytes it fetched, never
//! from a re-serialized model, so formatter drift cannot break
//! verification.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;
use std::collections::HashMap;
use zipline_errors::{Error, SigningError};
use zipline_manifest::{payload, Manifest};

/// Verifies manifest signatures against a set of trusted public keys
#[derive(Debug, Clone, Default)]
pub struct ManifestVerifier {
    keys: HashMap<String, VerifyingKey>,
    accept_unsigned: bool,
}

impl ManifestVerifier {
    /// Create a verifier with an empty trusted key set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a verifier that accepts any manifest without checking
    /// signatures. For development only.
    #[must_use]
    pub fn accept_unsigned() -> Self {
        Self {
            keys: HashMap::new(),
            accept_unsigned: true,
        }
    }

    /// Add a trusted ed25519 public key, hex encoded (32 bytes)
    ///
    /// # Errors
    /// Returns `SigningError::InvalidKey` if the hex or the key is
    /// malformed.
    pub fn add_key(mut self, name: impl Into<String>, hex_public_key: &str) -> Result<Self, Error> {
        let name = name.into();
        let bytes = hex::decode(hex_public_key).map_err(|e| SigningError::InvalidKey {
            name: name.clone(),
            message: e.to_string(),
        })?;
        let array: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| SigningError::InvalidKey {
            name: name.clone(),
            message: format!("public key must be 32 bytes, got {}", b.len()),
        })?;
        let key = VerifyingKey::from_bytes(&array).map_err(|e| SigningError::InvalidKey {
            name: name.clone(),
            message: e.to_string(),
        })?;

        self.keys.insert(name, key);
        Ok(self)
    }

    /// Verify a manifest's signatures against the trusted key set.
    ///
    /// Iterates the manifest's `signatures` in order and verifies every
    /// entry whose key name is trusted; the first success wins and its
    /// key name is returned. `Ok(None)` means the verifier is in
    /// accept-unsigned mode and did not check anything.
    ///
    /// # Errors
    /// - `SigningError::Unsigned` if the manifest has no signatures
    /// - `SigningError::NoTrustedKey` if no signature name is trusted
    /// - `SigningError::SignatureMismatch` if every trusted signature
    ///   fails to verify
    pub fn verify(
        &self,
        raw_manifest: &[u8],
        manifest: &Manifest,
    ) -> Result<Option<String>, Error> {
        if self.accept_unsigned {
            return Ok(None);
        }

        if manifest.signatures.is_empty() {
            return Err(SigningError::Unsigned.into());
        }

        // The signed bytes come from the document as fetched.
        let payload_bytes = payload::payload_bytes(raw_manifest)?;

        let mut first_trusted = None;
        for (key_name, signature_hex) in &manifest.signatures {
            let Some(key) = self.keys.get(key_name) else {
                continue;
            };
            first_trusted.get_or_insert(key_name.clone());

            let signature_bytes =
                hex::decode(signature_hex).map_err(|e| SigningError::InvalidSignatureFormat(
                    format!("signature {key_name} is not valid hex: {e}"),
                ))?;
            let signature = Signature::from_slice(&signature_bytes).map_err(|e| {
                SigningError::InvalidSignatureFormat(format!("signature {key_name}: {e}"))
            })?;

            if key.verify(&payload_bytes, &signature).is_ok() {
                return Ok(Some(key_name.clone()));
            }
        }

        match first_trusted {
            Some(key_name) => Err(SigningError::SignatureMismatch { key_name }.into()),
            None => Err(SigningError::NoTrustedKey.into()),
        }
    }
}

/// Signs manifests with one or more ed25519 keys
#[derive(Debug, Clone, Default)]
pub struct ManifestSigner {
    keys: Vec<(String, SigningKey)>,
}

impl ManifestSigner {
    /// Create a signer with no keys
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signing key from its hex-encoded 32-byte seed
    ///
    /// # Errors
    /// Returns `SigningError::InvalidKey` if the hex or the seed is
    /// malformed.
    pub fn add_key(mut self, name: impl Into<String>, hex_seed: &str) -> Result<Self, Error> {
        let name = name.into();
        let bytes = hex::decode(hex_seed).map_err(|e| SigningError::InvalidKey {
            name: name.clone(),
            message: e.to_string(),
        })?;
        let array: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| SigningError::InvalidKey {
            name: name.clone(),
            message: format!("signing key seed must be 32 bytes, got {}", b.len()),
        })?;

        self.keys.push((name, SigningKey::from_bytes(&array)));
        Ok(self)
    }

    /// Hex-encoded public keys for every signing key, for configuring a
    /// verifier.
    #[must_use]
    pub fn public_keys(&self) -> Vec<(String, String)> {
        self.keys
            .iter()
            .map(|(name, key)| (name.clone(), hex::encode(key.verifying_key().to_bytes())))
            .collect()
    }

    /// Sign a manifest document in place.
    ///
    /// The key names are inserted into `signatures` with empty values
    /// first, because the signed payload covers the signature key set;
    /// then each value is filled with the hex signature over the
    /// canonical payload.
    ///
    /// # Errors
    /// Returns an error if the document is not an object or cannot be
    /// serialized.
    pub fn sign(&self, manifest_json: &mut Value) -> Result<(), Error> {
        {
            let Value::Object(root) = &mut *manifest_json else {
                return Err(SigningError::InvalidSignatureFormat(
                    "manifest must be a JSON object".to_string(),
                )
                .into());
            };

            let signatures = root
                .entry("signatures".to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            let Value::Object(signatures) = signatures else {
                return Err(SigningError::InvalidSignatureFormat(
                    "signatures must be a JSON object".to_string(),
                )
                .into());
            };
            for (name, _) in &self.keys {
                signatures.insert(name.clone(), Value::String(String::new()));
            }
        }

        let payload_bytes = payload::to_compact(&payload::signature_payload(manifest_json))?;

        if let Some(signatures) = manifest_json
            .get_mut("signatures")
            .and_then(Value::as_object_mut)
        {
            for (name, key) in &self.keys {
                let signature = key.sign(payload_bytes.as_bytes());
                signatures.insert(
                    name.clone(),
                    Value::String(hex::encode(signature.to_bytes())),
                );
            }
        }

        Ok(())
    }
}
