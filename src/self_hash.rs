//! One-shot self-hash validation against the published release hash.

use crate::errors::{GuardError, GuardResult};
use crate::fingerprint::hash_file;
use crate::incident::IncidentKind;
use crate::package_index::{HashLookup, ReleaseHashSource};
use crate::runtime_identity::RuntimeIdentity;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Outcome of the one-shot validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SelfHashOutcome {
    Verified { local: String },
    /// The local hash differs from (or could not be compared with) the
    /// published one but matches the configured override.
    OverrideAccepted { local: String },
    Mismatch { local: String, reference: String },
    Offline { local: String, reason: String },
}

impl SelfHashOutcome {
    pub fn local(&self) -> &str {
        match self {
            SelfHashOutcome::Verified { local }
            | SelfHashOutcome::OverrideAccepted { local }
            | SelfHashOutcome::Mismatch { local, .. }
            | SelfHashOutcome::Offline { local, .. } => local,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SelfHashOutcome::Verified { .. } => "verified",
            SelfHashOutcome::OverrideAccepted { .. } => "override accepted",
            SelfHashOutcome::Mismatch { .. } => "MISMATCH",
            SelfHashOutcome::Offline { .. } => "offline, not verified",
        }
    }
}

/// Single SHA-256 over every file under `root`, contents concatenated in
/// sorted path order.
pub fn hash_source_tree(root: &Path) -> GuardResult<String> {
    let mut hasher = Sha256::new();
    let mut files = 0usize;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            GuardError::io(
                format!("walking {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let mut file = File::open(entry.path())
            .map_err(|e| GuardError::io(format!("reading {}", entry.path().display()), e))?;
        std::io::copy(&mut file, &mut hasher)
            .map_err(|e| GuardError::io(format!("hashing {}", entry.path().display()), e))?;
        files += 1;
    }
    if files == 0 {
        return Err(GuardError::integrity(format!(
            "no source files under {}",
            root.display()
        )));
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash of the configured source tree, or of the running executable when
/// the tree is not present.
pub fn local_hash(root: &Path) -> GuardResult<String> {
    if root.is_dir() {
        return hash_source_tree(root);
    }
    let exe = std::env::current_exe().map_err(|e| GuardError::io("locating executable", e))?;
    hash_file(&exe).ok_or_else(|| GuardError::integrity("executable could not be hashed"))
}

/// Compare the local hash with the published release hash.
///
/// Network failure is never fatal, whatever the override says. A confirmed
/// mismatch against a published hash is fatal under hardened mode and the
/// override hash cannot change that.
pub fn validate_self(identity: &RuntimeIdentity, source: &dyn ReleaseHashSource) -> GuardResult<SelfHashOutcome> {
    let config = identity.guard_config();
    let hardened = identity.runtime().hardened;
    let local = local_hash(&config.source_root())?;
    let trusted = config.trusted_hash.as_deref().map(str::to_ascii_lowercase);
    let override_matches = trusted.as_deref() == Some(local.as_str());

    let reference = match source.release_hash(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")) {
        HashLookup::Found(canonical) if canonical == local => {
            info!(message = "self-hash verified", hash = %local);
            return Ok(SelfHashOutcome::Verified { local });
        }
        HashLookup::Found(canonical) => {
            if !hardened && override_matches {
                warn!(message = "self-hash differs from published release; override hash accepted", local = %local, published = %canonical);
                return Ok(SelfHashOutcome::OverrideAccepted { local });
            }
            canonical
        }
        // Without a published hash there is nothing to confirm a mismatch
        // against, so the override can only accept.
        HashLookup::Offline(reason) => {
            warn!(message = "offline, skipping validation", reason = %reason);
            if override_matches {
                return Ok(SelfHashOutcome::OverrideAccepted { local });
            }
            if let Some(trusted) = trusted {
                warn!(message = "override hash does not match local build", local = %local, trusted = %trusted);
            }
            return Ok(SelfHashOutcome::Offline { local, reason });
        }
    };

    let incident = identity.record_incident(
        IncidentKind::SelfHashMismatch,
        reference.clone(),
        local.clone(),
        vec![config.source_root().display().to_string()],
    );
    if hardened {
        error!(message = "self-hash mismatch", incident_id = %incident.incident_id);
        return Err(GuardError::Tamper(incident.report()));
    }
    warn!(
        message = "self-hash mismatch",
        local = %local,
        reference = %reference,
        incident_id = %incident.incident_id
    );
    Ok(SelfHashOutcome::Mismatch { local, reference })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_tree_hash_is_order_stable() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("b")).unwrap();
        fs::write(temp.path().join("a.rs"), "alpha").unwrap();
        fs::write(temp.path().join("b/c.rs"), "gamma").unwrap();
        let first = hash_source_tree(temp.path()).unwrap();

        let expected = format!("{:x}", Sha256::digest(b"alphagamma"));
        assert_eq!(first, expected);

        fs::write(temp.path().join("b/c.rs"), "delta").unwrap();
        assert_ne!(hash_source_tree(temp.path()).unwrap(), first);
    }

    #[test]
    fn test_empty_tree_rejected() {
        let temp = TempDir::new().unwrap();
        assert!(hash_source_tree(temp.path()).is_err());
    }

    #[test]
    fn test_outcome_labels() {
        let outcome = SelfHashOutcome::Offline {
            local: "abc".into(),
            reason: "timeout".into(),
        };
        assert_eq!(outcome.local(), "abc");
        assert_eq!(outcome.label(), "offline, not verified");
    }
}
