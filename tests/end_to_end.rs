//! Full boot through the orchestrator with in-memory collaborators, then
//! imports through the sealed hooks while the patrol runs.

use depgate::errors::{GuardError, GuardResult};
use depgate::incident::IncidentKind;
use depgate::installer::{DistributionCatalog, PackageInstaller};
use depgate::package_index::{HashLookup, PackageIndex, ReleaseHashSource};
use depgate::patrol::{Escalation, PatrolFailure};
use depgate::self_hash::{hash_source_tree, SelfHashOutcome};
use depgate::sigverify::{signing_key_from_hex, SignatureStore};
use depgate::{BootMode, BootOutcome, GuardConfig, SealingOrchestrator};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Offline;

impl ReleaseHashSource for Offline {
    fn release_hash(&self, _package: &str, _version: &str) -> HashLookup {
        HashLookup::Offline("no network in tests".into())
    }
}

struct Published(String);

impl ReleaseHashSource for Published {
    fn release_hash(&self, _package: &str, _version: &str) -> HashLookup {
        HashLookup::Found(self.0.clone())
    }
}

struct OnIndex;

impl PackageIndex for OnIndex {
    fn distribution_exists(&self, _distribution: &str) -> bool {
        true
    }
}

struct NothingInstalled;

impl DistributionCatalog for NothingInstalled {
    fn is_installed(&self, _distribution: &str) -> bool {
        false
    }
}

struct CountingInstaller {
    site: PathBuf,
    calls: AtomicUsize,
}

impl PackageInstaller for CountingInstaller {
    fn install(&self, requirement: &str) -> GuardResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let package = self.site.join(requirement);
        fs::create_dir_all(&package).map_err(|e| GuardError::io("fake install", e))?;
        fs::write(package.join("__init__.py"), "").map_err(|e| GuardError::io("fake install", e))
    }
}

fn config(temp: &Path, site: &Path) -> GuardConfig {
    GuardConfig {
        audit_log: temp.join("incidents.jsonl"),
        signature_store: temp.join("signatures.json"),
        site_packages: vec![site.to_path_buf()],
        patrol_threads: 2,
        patrol_min_secs: 0.01,
        patrol_max_secs: 0.03,
        no_capture: true,
        ..GuardConfig::default()
    }
}

fn write_tree(root: &Path) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join("lib.rs"), "pub fn shipped() {}").unwrap();
}

#[test]
fn boot_then_auto_install_an_absent_package() {
    let temp = TempDir::new().unwrap();
    let site = temp.path().join("site");
    fs::create_dir_all(&site).unwrap();
    let installer = Arc::new(CountingInstaller {
        site: site.clone(),
        calls: AtomicUsize::new(0),
    });

    let (tx, rx) = mpsc::channel();
    let fake = Arc::clone(&installer);
    let outcome = SealingOrchestrator::new(config(temp.path(), &site))
        .install_logging(false)
        .print_banner(false)
        .release_source(Arc::new(Offline))
        .escalation(Escalation::Supervisor(tx))
        .customize(move |builder| {
            builder
                .index(Arc::new(OnIndex))
                .installer(fake)
                .catalog(Arc::new(NothingInstalled))
        })
        .run()
        .unwrap();

    assert_eq!(outcome.report.mode, BootMode::Secure);
    assert!(!outcome.report.hardened);
    assert_eq!(outcome.report.patrol_threads, 3);
    let identity = &outcome.identity;

    let module = identity.import("leftpad").unwrap();
    assert_eq!(module.name, "leftpad");
    assert_eq!(installer.calls.load(Ordering::SeqCst), 1);

    // Second resolution finds the installed package without another install.
    identity.import("leftpad").unwrap();
    assert_eq!(installer.calls.load(Ordering::SeqCst), 1);

    // The patrol keeps ticking and reports nothing.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    let watchdog = outcome.watchdog.as_ref().unwrap();
    assert!(watchdog.total_ticks() > 0);

    assert!(identity.incidents().read_all().unwrap().is_empty());
    assert!(identity.check_integrity().unwrap().is_clean());
}

#[test]
fn child_boot_carries_parent_id() {
    let temp = TempDir::new().unwrap();
    let site = temp.path().join("site");
    let outcome = SealingOrchestrator::new(GuardConfig {
        child: true,
        parent_id: Some("parent-corr".into()),
        disable_integrity_check: true,
        ..config(temp.path(), &site)
    })
    .install_logging(false)
    .print_banner(false)
    .release_source(Arc::new(Offline))
    .customize(|builder| builder.index(Arc::new(OnIndex)))
    .run()
    .unwrap();

    assert_eq!(outcome.report.mode, BootMode::Child);
    assert_eq!(outcome.report.parent_correlation_id.as_deref(), Some("parent-corr"));
    assert_ne!(outcome.report.correlation_id, "parent-corr");
    assert!(outcome.identity.registry().is_sealed());
}

#[test]
fn hardened_boot_aborts_on_self_hash_mismatch() {
    let temp = TempDir::new().unwrap();
    let site = temp.path().join("site");
    let tree = temp.path().join("tree");
    write_tree(&tree);

    let result = SealingOrchestrator::new(GuardConfig {
        hardened: true,
        source_root: Some(tree.clone()),
        ..config(temp.path(), &site)
    })
    .install_logging(false)
    .print_banner(false)
    .release_source(Arc::new(Published("0".repeat(64))))
    .customize(|builder| builder.index(Arc::new(OnIndex)))
    .run();

    let err = result.err().unwrap();
    assert!(matches!(err, GuardError::Tamper(_)));
    assert!(err.is_fatal());
}

#[test]
fn override_hash_accepts_local_tree() {
    let temp = TempDir::new().unwrap();
    let site = temp.path().join("site");
    let tree = temp.path().join("tree");
    write_tree(&tree);
    let local = hash_source_tree(&tree).unwrap();

    let outcome = SealingOrchestrator::new(GuardConfig {
        source_root: Some(tree),
        trusted_hash: Some(local.clone()),
        disable_integrity_check: true,
        ..config(temp.path(), &site)
    })
    .install_logging(false)
    .print_banner(false)
    .release_source(Arc::new(Published("f".repeat(64))))
    .customize(|builder| builder.index(Arc::new(OnIndex)))
    .run()
    .unwrap();

    assert!(outcome.report.trusted_hash_in_use);
    assert_eq!(
        outcome.report.self_hash,
        Some(SelfHashOutcome::OverrideAccepted { local })
    );
}

/// Quiet boot with a supervisor channel so a patrol failure cannot exit the
/// test process. The receiver is returned to keep the channel open.
fn quiet_boot(
    config: GuardConfig,
    source: Arc<dyn ReleaseHashSource>,
) -> GuardResult<(BootOutcome, Receiver<PatrolFailure>)> {
    let (tx, rx) = mpsc::channel();
    SealingOrchestrator::new(config)
        .install_logging(false)
        .print_banner(false)
        .release_source(source)
        .escalation(Escalation::Supervisor(tx))
        .customize(|builder| builder.index(Arc::new(OnIndex)))
        .run()
        .map(|outcome| (outcome, rx))
}

#[test]
fn offline_registry_never_aborts_hardened_boot() {
    let temp = TempDir::new().unwrap();
    let site = temp.path().join("site");
    let tree = temp.path().join("tree");
    write_tree(&tree);
    let local = hash_source_tree(&tree).unwrap();

    let hardened = |trusted_hash: Option<String>| GuardConfig {
        hardened: true,
        source_root: Some(tree.clone()),
        trusted_hash,
        ..config(temp.path(), &site)
    };

    let (outcome, _patrol) = quiet_boot(hardened(None), Arc::new(Offline)).unwrap();
    assert!(matches!(outcome.report.self_hash, Some(SelfHashOutcome::Offline { .. })));

    let (outcome, _patrol) = quiet_boot(hardened(Some(local.clone())), Arc::new(Offline)).unwrap();
    assert_eq!(
        outcome.report.self_hash,
        Some(SelfHashOutcome::OverrideAccepted { local: local.clone() })
    );

    // A stale override cannot be confirmed or refuted without the registry.
    let (outcome, _patrol) = quiet_boot(hardened(Some("0".repeat(64))), Arc::new(Offline)).unwrap();
    match &outcome.report.self_hash {
        Some(SelfHashOutcome::Offline { local: hashed, .. }) => assert_eq!(hashed, &local),
        other => panic!("expected offline outcome, got {other:?}"),
    }
    assert!(outcome.report.trusted_hash_in_use);
    assert!(outcome.identity.incidents().read_all().unwrap().is_empty());
}

/// Writes a store signed with a key other than the embedded one.
fn write_foreign_store(temp: &Path, site: &Path) {
    let (outcome, _patrol) = quiet_boot(
        GuardConfig {
            disable_integrity_check: true,
            ..config(temp, site)
        },
        Arc::new(Offline),
    )
    .unwrap();
    let foreign = signing_key_from_hex(&"07".repeat(32)).unwrap();
    let store = SignatureStore::sign(outcome.identity.namespace(), &foreign).unwrap();
    assert!(!store.entries.is_empty());
    store.save(&temp.join("signatures.json")).unwrap();
}

#[test]
fn failing_signature_store_aborts_hardened_boot() {
    let temp = TempDir::new().unwrap();
    let site = temp.path().join("site");
    write_foreign_store(temp.path(), &site);

    let err = quiet_boot(
        GuardConfig {
            hardened: true,
            ..config(temp.path(), &site)
        },
        Arc::new(Offline),
    )
    .err()
    .unwrap();
    assert!(matches!(err, GuardError::Tamper(_)));
}

#[test]
fn failing_signature_store_is_reported_when_not_hardened() {
    let temp = TempDir::new().unwrap();
    let site = temp.path().join("site");
    write_foreign_store(temp.path(), &site);

    let (outcome, _patrol) = quiet_boot(
        GuardConfig {
            disable_integrity_check: true,
            ..config(temp.path(), &site)
        },
        Arc::new(Offline),
    )
    .unwrap();

    let signatures = outcome.report.signatures.as_ref().unwrap();
    assert!(signatures.store_present);
    assert!(!signatures.is_clean());
    assert!(signatures.verified.is_empty());

    let incidents = outcome.identity.incidents().read_all().unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].kind, IncidentKind::SignatureFailure);
}
