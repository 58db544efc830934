//! Identity registry: capture, digest and freeze the identities bound to the
//! sealed labels, then compare fresh samples against the frozen digest.

use crate::clock::{Clock, TimestampFormat};
use crate::errors::{GuardError, GuardResult};
use crate::namespace::{Binding, Namespace, SEALED_TARGETS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Stable per-object integer for the life of the object.
pub type IdentityHandle = u64;

/// Reserved snapshot label carrying the session correlation id.
pub const CORRELATION_LABEL: &str = "global_.correlation_id";
/// Reserved snapshot label carrying the capture timestamp. Not digested.
pub const SEALED_ON_LABEL: &str = "global_.sealed_on";

/// How an identity handle is derived from a bound object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStrategy {
    /// The object's address. Detects any replacement, including by an
    /// identical copy.
    #[default]
    Address,
    /// Hash of the object's type name and source text. Survives
    /// re-instantiation; detects replacement by different code.
    Structural,
}

impl IdentityStrategy {
    pub fn handle(&self, address: usize, qualified_name: &str, source: &str) -> IdentityHandle {
        match self {
            IdentityStrategy::Address => address as IdentityHandle,
            IdentityStrategy::Structural => structural_handle(qualified_name, source),
        }
    }

    pub fn handle_of(&self, binding: &Binding) -> IdentityHandle {
        self.handle(binding.address(), binding.qualified_name(), binding.source())
    }
}

/// Full SHA-256 over `qualified_name \0 source`, hex encoded.
pub fn structural_digest(qualified_name: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(qualified_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First eight bytes of the structural digest, big endian.
pub fn structural_handle(qualified_name: &str, source: &str) -> IdentityHandle {
    let mut hasher = Sha256::new();
    hasher.update(qualified_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Label to handle mapping plus the reserved correlation and timestamp
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub handles: BTreeMap<String, IdentityHandle>,
    pub correlation_id: String,
    pub captured_at: String,
}

impl IdentitySnapshot {
    pub fn new(
        handles: BTreeMap<String, IdentityHandle>,
        correlation_id: impl Into<String>,
        captured_at: impl Into<String>,
    ) -> Self {
        Self {
            handles,
            correlation_id: correlation_id.into(),
            captured_at: captured_at.into(),
        }
    }

    /// Resolve every target. A target that is not bound is fatal.
    pub fn capture<S: AsRef<str>>(
        namespace: &Namespace,
        targets: &[S],
        strategy: IdentityStrategy,
        correlation_id: &str,
        clock: &Clock,
    ) -> GuardResult<Self> {
        let mut handles = BTreeMap::new();
        for label in targets.iter().map(AsRef::as_ref) {
            let binding = namespace
                .get(label)?
                .ok_or_else(|| GuardError::UnresolvedTarget {
                    label: label.to_string(),
                })?;
            handles.insert(label.to_string(), strategy.handle_of(&binding));
        }
        Ok(Self::new(
            handles,
            correlation_id,
            clock.timestamp(TimestampFormat::IsoUtc),
        ))
    }

    /// Resolve whatever is bound right now; unbound targets are left out.
    pub fn sample<S: AsRef<str>>(
        namespace: &Namespace,
        targets: &[S],
        strategy: IdentityStrategy,
        correlation_id: &str,
    ) -> GuardResult<Self> {
        let mut handles = BTreeMap::new();
        for label in targets.iter().map(AsRef::as_ref) {
            if let Some(binding) = namespace.get(label)? {
                handles.insert(label.to_string(), strategy.handle_of(&binding));
            }
        }
        Ok(Self::new(handles, correlation_id, String::new()))
    }

    /// Deterministic serialization: sorted keys, handles plus the correlation
    /// id. The capture timestamp is excluded.
    pub fn canonical_bytes(&self) -> GuardResult<Vec<u8>> {
        let mut entries: BTreeMap<&str, serde_json::Value> = self
            .handles
            .iter()
            .map(|(label, handle)| (label.as_str(), serde_json::Value::from(*handle)))
            .collect();
        entries.insert(
            CORRELATION_LABEL,
            serde_json::Value::from(self.correlation_id.as_str()),
        );
        serde_json::to_vec(&entries)
            .map_err(|e| GuardError::serialization("identity snapshot", e))
    }

    pub fn digest(&self) -> GuardResult<String> {
        let bytes = self.canonical_bytes()?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

/// Frozen result of sealing.
#[derive(Debug, Clone, Serialize)]
pub struct SealedIdentity {
    pub snapshot: IdentitySnapshot,
    pub digest: String,
    /// Audit digest over the whole snapshot, timestamp and strategy included.
    pub composite_digest: String,
    pub strategy: IdentityStrategy,
    #[serde(skip)]
    pub sealed_after: Duration,
}

impl SealedIdentity {
    fn freeze(
        snapshot: IdentitySnapshot,
        strategy: IdentityStrategy,
        sealed_after: Duration,
    ) -> GuardResult<Self> {
        let digest = snapshot.digest()?;
        let composite = serde_json::json!({
            "digest": digest,
            "handles": snapshot.handles,
            CORRELATION_LABEL: snapshot.correlation_id,
            SEALED_ON_LABEL: snapshot.captured_at,
            "strategy": strategy,
        });
        let composite_bytes = serde_json::to_vec(&composite)
            .map_err(|e| GuardError::serialization("composite digest", e))?;
        Ok(Self {
            composite_digest: format!("{:x}", Sha256::digest(&composite_bytes)),
            snapshot,
            digest,
            strategy,
            sealed_after,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelMismatch {
    pub label: String,
    pub expected: IdentityHandle,
    pub found: Option<IdentityHandle>,
}

/// Outcome of comparing a fresh sample against the sealed digest.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityComparison {
    pub expected: String,
    pub found: String,
    pub mismatched: Vec<LabelMismatch>,
    pub elapsed: Duration,
}

impl IdentityComparison {
    pub fn is_clean(&self) -> bool {
        self.expected == self.found
    }

    pub fn mismatched_labels(&self) -> Vec<&str> {
        self.mismatched.iter().map(|m| m.label.as_str()).collect()
    }
}

#[derive(Debug)]
pub struct IdentityRegistry {
    targets: Vec<String>,
    strategy: IdentityStrategy,
    sealed: OnceLock<SealedIdentity>,
}

impl IdentityRegistry {
    pub fn new<S: Into<String>>(targets: impl IntoIterator<Item = S>, strategy: IdentityStrategy) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            strategy,
            sealed: OnceLock::new(),
        }
    }

    pub fn with_strategy(strategy: IdentityStrategy) -> Self {
        Self::new(SEALED_TARGETS, strategy)
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn strategy(&self) -> IdentityStrategy {
        self.strategy
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    pub fn sealed(&self) -> Option<&SealedIdentity> {
        self.sealed.get()
    }

    pub fn sealed_handle(&self, label: &str) -> Option<IdentityHandle> {
        self.sealed
            .get()
            .and_then(|sealed| sealed.snapshot.handles.get(label).copied())
    }

    /// Seal once. Later calls return the already frozen identity untouched.
    pub fn seal(
        &self,
        namespace: &Namespace,
        correlation_id: &str,
        clock: &Clock,
    ) -> GuardResult<&SealedIdentity> {
        if let Some(sealed) = self.sealed.get() {
            debug!(
                message = "seal requested again; keeping frozen identity",
                digest = %sealed.digest
            );
            return Ok(sealed);
        }

        let snapshot =
            IdentitySnapshot::capture(namespace, &self.targets, self.strategy, correlation_id, clock)?;
        let frozen = SealedIdentity::freeze(snapshot, self.strategy, clock.now())?;
        let sealed = self.sealed.get_or_init(|| frozen);

        info!(
            message = "runtime identity sealed",
            correlation_id = %correlation_id,
            labels = sealed.snapshot.handles.len(),
            digest = %sealed.digest
        );
        Ok(sealed)
    }

    /// Re-resolve the targets now and compare to the frozen digest.
    pub fn compare(&self, namespace: &Namespace) -> GuardResult<IdentityComparison> {
        let started = Instant::now();
        let sealed = self.sealed.get().ok_or(GuardError::NotSealed)?;
        let current = IdentitySnapshot::sample(
            namespace,
            &self.targets,
            self.strategy,
            &sealed.snapshot.correlation_id,
        )?;
        let found = current.digest()?;

        let mismatched = if found == sealed.digest {
            Vec::new()
        } else {
            self.targets
                .iter()
                .filter_map(|label| {
                    let expected = sealed.snapshot.handles.get(label).copied()?;
                    let now = current.handles.get(label).copied();
                    (now != Some(expected)).then(|| LabelMismatch {
                        label: label.clone(),
                        expected,
                        found: now,
                    })
                })
                .collect()
        };

        Ok(IdentityComparison {
            expected: sealed.digest.clone(),
            found,
            mismatched,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Guarded;
    use std::sync::Arc;

    struct Alpha;
    struct Beta;

    impl Guarded for Alpha {
        fn source(&self) -> &'static str {
            "fn alpha() {}"
        }
    }

    impl Guarded for Beta {
        fn source(&self) -> &'static str {
            "fn beta() {}"
        }
    }

    fn populated(labels: &[&str]) -> Namespace {
        let namespace = Namespace::new();
        for label in labels {
            namespace
                .bind(*label, Binding::Sink(Arc::new(Alpha)))
                .unwrap();
        }
        namespace
    }

    #[test]
    fn test_seal_is_idempotent() {
        let namespace = populated(&["a.one", "a.two"]);
        let registry = IdentityRegistry::new(["a.one", "a.two"], IdentityStrategy::Address);
        let clock = Clock::starting_now();

        let first = registry.seal(&namespace, "corr-1", &clock).unwrap().digest.clone();
        namespace.bind("a.one", Binding::Sink(Arc::new(Beta))).unwrap();
        let second = registry.seal(&namespace, "corr-2", &clock).unwrap();

        assert_eq!(first, second.digest);
        assert_eq!(second.snapshot.correlation_id, "corr-1");
    }

    #[test]
    fn test_digest_determinism() {
        let handles: BTreeMap<String, IdentityHandle> =
            [("x".to_string(), 1), ("y".to_string(), 2)].into_iter().collect();
        let a = IdentitySnapshot::new(handles.clone(), "c", "t1");
        let b = IdentitySnapshot::new(handles.clone(), "c", "t2");
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        let mut changed = handles;
        changed.insert("y".to_string(), 3);
        let c = IdentitySnapshot::new(changed, "c", "t1");
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
    }

    #[test]
    fn test_mismatch_reports_only_replaced_label() {
        let namespace = populated(&["a.one", "a.two", "a.three"]);
        let registry = IdentityRegistry::new(["a.one", "a.two", "a.three"], IdentityStrategy::Address);
        registry.seal(&namespace, "corr", &Clock::starting_now()).unwrap();
        assert!(registry.compare(&namespace).unwrap().is_clean());

        namespace.bind("a.two", Binding::Sink(Arc::new(Alpha))).unwrap();
        let comparison = registry.compare(&namespace).unwrap();
        assert!(!comparison.is_clean());
        assert_eq!(comparison.mismatched_labels(), vec!["a.two"]);
    }

    #[test]
    fn test_missing_label_counts_as_mismatch() {
        let namespace = populated(&["a.one", "a.two"]);
        let registry = IdentityRegistry::new(["a.one", "a.two"], IdentityStrategy::Address);
        registry.seal(&namespace, "corr", &Clock::starting_now()).unwrap();

        namespace.unbind("a.one").unwrap();
        let comparison = registry.compare(&namespace).unwrap();
        assert_eq!(comparison.mismatched.len(), 1);
        assert_eq!(comparison.mismatched[0].found, None);
    }

    #[test]
    fn test_unresolved_target_is_fatal() {
        let namespace = populated(&["a.one"]);
        let registry = IdentityRegistry::new(["a.one", "a.missing"], IdentityStrategy::Address);
        let err = registry
            .seal(&namespace, "corr", &Clock::starting_now())
            .unwrap_err();
        assert!(matches!(err, GuardError::UnresolvedTarget { ref label } if label == "a.missing"));
        assert!(err.is_fatal());
        assert!(!registry.is_sealed());
    }

    #[test]
    fn test_compare_before_seal() {
        let registry = IdentityRegistry::new(["a.one"], IdentityStrategy::Address);
        assert!(matches!(
            registry.compare(&Namespace::new()),
            Err(GuardError::NotSealed)
        ));
    }

    #[test]
    fn test_structural_strategy_tracks_code_not_address() {
        let namespace = populated(&["a.one"]);
        let registry = IdentityRegistry::new(["a.one"], IdentityStrategy::Structural);
        registry.seal(&namespace, "corr", &Clock::starting_now()).unwrap();

        namespace.bind("a.one", Binding::Sink(Arc::new(Alpha))).unwrap();
        assert!(registry.compare(&namespace).unwrap().is_clean());

        namespace.bind("a.one", Binding::Sink(Arc::new(Beta))).unwrap();
        assert_eq!(
            registry.compare(&namespace).unwrap().mismatched_labels(),
            vec!["a.one"]
        );
    }

    #[test]
    fn test_composite_differs_from_check_digest() {
        let namespace = populated(&["a.one"]);
        let registry = IdentityRegistry::new(["a.one"], IdentityStrategy::Address);
        let sealed = registry.seal(&namespace, "corr", &Clock::starting_now()).unwrap();
        assert_eq!(sealed.digest.len(), 64);
        assert_eq!(sealed.composite_digest.len(), 64);
        assert_ne!(sealed.digest, sealed.composite_digest);
        assert!(registry.sealed_handle("a.one").is_some());
    }
}
