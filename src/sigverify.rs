//! Signature store: expected structural digest and Ed25519 signature per
//! guarded type.

use crate::errors::{GuardError, GuardResult};
use crate::identity::structural_digest;
use crate::incident::IncidentKind;
use crate::namespace::Namespace;
use crate::runtime_identity::RuntimeIdentity;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

/// Public key shipped with the package.
pub const EMBEDDED_PUBLIC_KEY: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Hex SHA-256 of `qualified_name \0 source`.
    pub sha256: String,
    /// Base64 Ed25519 signature over the raw digest bytes.
    pub sig: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureStore {
    pub entries: BTreeMap<String, SignatureEntry>,
}

impl SignatureStore {
    pub fn load(path: &Path) -> GuardResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GuardError::io(format!("reading signature store {}", path.display()), e))?;
        serde_json::from_str(&text).map_err(|e| GuardError::serialization("signature store", e))
    }

    pub fn save(&self, path: &Path) -> GuardResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| GuardError::io("creating signature store directory", e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GuardError::serialization("signature store", e))?;
        std::fs::write(path, json).map_err(|e| GuardError::io("writing signature store", e))
    }

    /// Sign every guarded object bound in `namespace`.
    pub fn sign(namespace: &Namespace, signing_key: &SigningKey) -> GuardResult<Self> {
        let mut entries = BTreeMap::new();
        for label in namespace.labels()? {
            let Some(binding) = namespace.get(&label)? else {
                continue;
            };
            let digest = structural_digest(binding.qualified_name(), binding.source());
            let digest_bytes = decode_digest(&digest)?;
            let signature = signing_key.sign(&digest_bytes);
            entries.insert(
                binding.qualified_name().to_string(),
                SignatureEntry {
                    sha256: digest,
                    sig: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
                },
            );
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignatureReport {
    pub store_present: bool,
    pub verified: Vec<String>,
    pub failed: Vec<String>,
    pub unsigned: Vec<String>,
}

impl SignatureReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn decode_digest(hex_digest: &str) -> GuardResult<Vec<u8>> {
    hex::decode(hex_digest).map_err(|e| GuardError::crypto(format!("invalid digest hex: {e}")))
}

pub fn verifying_key(hex_key: Option<&str>) -> GuardResult<VerifyingKey> {
    let bytes = hex::decode(hex_key.unwrap_or(EMBEDDED_PUBLIC_KEY))
        .map_err(|e| GuardError::crypto(format!("invalid public key hex: {e}")))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| GuardError::crypto("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&array).map_err(|e| GuardError::crypto(format!("invalid public key: {e}")))
}

/// Signing key from a 32-byte hex seed.
pub fn signing_key_from_hex(hex_seed: &str) -> GuardResult<SigningKey> {
    let bytes = hex::decode(hex_seed.trim()).map_err(|e| GuardError::crypto(format!("invalid key hex: {e}")))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| GuardError::crypto("signing key seed must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&array))
}

fn verify_entry(entry: &SignatureEntry, digest: &str, key: &VerifyingKey) -> bool {
    if !entry.sha256.eq_ignore_ascii_case(digest) {
        return false;
    }
    let Ok(digest_bytes) = decode_digest(digest) else {
        return false;
    };
    let Ok(sig_bytes) = base64::engine::general_purpose::STANDARD.decode(&entry.sig) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    key.verify(&digest_bytes, &Signature::from_bytes(&sig_array)).is_ok()
}

/// Check every sealed binding against `store`.
pub fn check_store(namespace: &Namespace, store: &SignatureStore, key: &VerifyingKey) -> GuardResult<SignatureReport> {
    let mut report = SignatureReport {
        store_present: true,
        ..SignatureReport::default()
    };
    for label in namespace.labels()? {
        let Some(binding) = namespace.get(&label)? else {
            continue;
        };
        let qualified = binding.qualified_name();
        let digest = structural_digest(qualified, binding.source());
        match store.entries.get(qualified) {
            None => report.unsigned.push(label),
            Some(entry) if verify_entry(entry, &digest, key) => report.verified.push(label),
            Some(_) => report.failed.push(label),
        }
    }
    Ok(report)
}

/// Verify the configured store. A missing store is a warning unless
/// signatures are required.
pub fn verify_signatures(identity: &RuntimeIdentity) -> GuardResult<SignatureReport> {
    let config = identity.guard_config();
    let path = &config.signature_store;
    if !path.exists() {
        if config.require_signatures {
            return Err(GuardError::integrity(format!(
                "signature store {} is required but missing",
                path.display()
            )));
        }
        warn!(message = "signature store not found; skipping signature verification", path = %path.display());
        return Ok(SignatureReport::default());
    }

    let key = verifying_key(config.signature_public_key.as_deref())?;
    let store = SignatureStore::load(path)?;
    let report = check_store(identity.namespace(), &store, &key)?;

    let must_sign = config.require_signatures && !report.unsigned.is_empty();
    if report.is_clean() && !must_sign {
        info!(
            message = "signature store verified",
            verified = report.verified.len(),
            unsigned = report.unsigned.len()
        );
        return Ok(report);
    }

    let mut labels = report.failed.clone();
    if must_sign {
        labels.extend(report.unsigned.iter().cloned());
    }
    let incident = identity.record_incident(
        IncidentKind::SignatureFailure,
        "signed",
        format!("{} failed, {} unsigned", report.failed.len(), report.unsigned.len()),
        labels,
    );
    if identity.runtime().hardened || config.require_signatures {
        error!(message = "signature verification failed", incident_id = %incident.incident_id);
        return Err(GuardError::Tamper(incident.report()));
    }
    warn!(
        message = "signature verification failed",
        failed = ?report.failed,
        unsigned = ?report.unsigned,
        incident_id = %incident.incident_id
    );
    Ok(report)
}
