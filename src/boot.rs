//! Sealing orchestrator.
//!
//! Runs once per process, on the calling thread, before any host code gets
//! the import API. Each step is a precondition for the next: detect the mode,
//! seal, install the hooks, validate the self-hash and signatures, start the
//! patrol, open the API gate, then print the banner and release the buffered
//! boot log.

use crate::boot_capture::{init_logging, BootCapture};
use crate::bootwall;
use crate::config_loader::GuardConfig;
use crate::errors::GuardResult;
use crate::package_index::{CratesIoRegistry, ReleaseHashSource};
use crate::patrol::{Escalation, Watchdog, WatchdogState};
use crate::runtime_config::{BootMode, RuntimeConfig};
use crate::runtime_identity::{RuntimeIdentity, RuntimeIdentityBuilder};
use crate::self_hash::{validate_self, SelfHashOutcome};
use crate::sigverify::{verify_signatures, SignatureReport};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize)]
pub struct SealSummary {
    pub labels: usize,
    pub digest: String,
    pub composite_digest: String,
    pub sealed_on: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    pub correlation_id: String,
    pub mode: BootMode,
    pub hardened: bool,
    pub parent_correlation_id: Option<String>,
    pub sealed: Option<SealSummary>,
    pub self_hash: Option<SelfHashOutcome>,
    pub signatures: Option<SignatureReport>,
    pub patrol_threads: usize,
    pub trusted_hash_in_use: bool,
    pub completed_at: chrono::DateTime<Utc>,
    #[serde(skip)]
    pub elapsed: Duration,
}

pub struct BootOutcome {
    pub identity: Arc<RuntimeIdentity>,
    pub report: BootReport,
    pub watchdog: Option<Arc<WatchdogState>>,
    pub capture: BootCapture,
}

type Customize = Box<dyn FnOnce(RuntimeIdentityBuilder) -> RuntimeIdentityBuilder>;

pub struct SealingOrchestrator {
    config: GuardConfig,
    customize: Option<Customize>,
    release_source: Option<Arc<dyn ReleaseHashSource>>,
    escalation: Escalation,
    install_logging: bool,
    print_banner: bool,
}

impl SealingOrchestrator {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            customize: None,
            release_source: None,
            escalation: Escalation::ExitProcess,
            install_logging: true,
            print_banner: true,
        }
    }

    /// Adjust the identity builder before it runs, e.g. to substitute the
    /// package index or installer.
    pub fn customize(
        mut self,
        customize: impl FnOnce(RuntimeIdentityBuilder) -> RuntimeIdentityBuilder + 'static,
    ) -> Self {
        self.customize = Some(Box::new(customize));
        self
    }

    pub fn release_source(mut self, source: Arc<dyn ReleaseHashSource>) -> Self {
        self.release_source = Some(source);
        self
    }

    pub fn escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn install_logging(mut self, install: bool) -> Self {
        self.install_logging = install;
        self
    }

    pub fn print_banner(mut self, print: bool) -> Self {
        self.print_banner = print;
        self
    }

    pub fn run(self) -> GuardResult<BootOutcome> {
        let started = Instant::now();

        // Step 1: mode and flags; log capture starts here.
        let runtime = RuntimeConfig::from_config(&self.config);
        let capture = BootCapture::new(!runtime.no_capture);
        if self.install_logging {
            init_logging(&self.config.log_level, runtime.mode == BootMode::Debug, &capture);
        }
        debug!(message = "boot mode detected", mode = %runtime.mode, hardened = runtime.hardened);

        let print_banner = self.print_banner;
        match self.sequence(runtime, capture.clone(), started) {
            Ok(outcome) => {
                if print_banner {
                    eprintln!("{}", bootwall::render(&outcome.report, outcome.identity.fingerprint()));
                }
                capture.release()?;
                Ok(outcome)
            }
            Err(e) => {
                error!(message = "boot aborted", error = %e);
                capture.release()?;
                Err(e)
            }
        }
    }

    fn sequence(self, runtime: RuntimeConfig, capture: BootCapture, started: Instant) -> GuardResult<BootOutcome> {
        let mut builder = RuntimeIdentity::builder(self.config).capture(capture.clone());
        if let Some(customize) = self.customize {
            builder = customize(builder);
        }
        let identity = Arc::new(builder.build()?);
        let config = identity.guard_config();

        let mut report = BootReport {
            correlation_id: identity.correlation_id().to_string(),
            mode: runtime.mode,
            hardened: runtime.hardened,
            parent_correlation_id: runtime.parent_correlation_id.clone(),
            sealed: None,
            self_hash: None,
            signatures: None,
            patrol_threads: 0,
            trusted_hash_in_use: config.trusted_hash.is_some(),
            completed_at: Utc::now(),
            elapsed: Duration::ZERO,
        };

        // Step 2: reduced-trust modes stop here.
        if runtime.mode.skips_sealing() {
            info!(message = "reduced-trust mode; sealing skipped", mode = %runtime.mode);
            identity.mark_boot_complete();
            report.elapsed = started.elapsed();
            return Ok(BootOutcome {
                identity,
                report,
                watchdog: None,
                capture,
            });
        }

        // Steps 3 and 4: seal, and record the composite digest.
        let sealed = identity.seal()?;
        report.sealed = Some(SealSummary {
            labels: sealed.snapshot.handles.len(),
            digest: sealed.digest.clone(),
            composite_digest: sealed.composite_digest.clone(),
            sealed_on: sealed.snapshot.captured_at.clone(),
        });
        info!(message = "composite digest recorded", composite_digest = %sealed.composite_digest);

        // Step 5: hooks go in only after their identities are sealed.
        identity.install_hooks()?;

        // Step 6: one-shot self-hash and signature validation.
        let release_source: Arc<dyn ReleaseHashSource> = match self.release_source {
            Some(source) => source,
            None => Arc::new(CratesIoRegistry::new(
                config.registry_url.clone(),
                config.network_timeout(),
            )?),
        };
        report.self_hash = Some(validate_self(&identity, release_source.as_ref())?);
        report.signatures = Some(verify_signatures(&identity)?);

        // Step 7: patrol.
        let watchdog = Watchdog::start(Arc::clone(&identity), self.escalation)?;
        report.patrol_threads = watchdog.threads.len();

        // Step 8: open the API gate.
        identity.mark_boot_complete();

        report.elapsed = started.elapsed();
        report.completed_at = Utc::now();
        info!(
            message = "boot complete",
            correlation_id = %report.correlation_id,
            elapsed_ms = report.elapsed.as_secs_f64() * 1000.0
        );
        Ok(BootOutcome {
            identity,
            report,
            watchdog: Some(watchdog),
            capture,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package_index::{HashLookup, PackageIndex};
    use tempfile::TempDir;

    struct Offline;

    impl ReleaseHashSource for Offline {
        fn release_hash(&self, _package: &str, _version: &str) -> HashLookup {
            HashLookup::Offline("test".into())
        }
    }

    struct NoIndex;

    impl PackageIndex for NoIndex {
        fn distribution_exists(&self, _distribution: &str) -> bool {
            false
        }
    }

    fn config(temp: &TempDir) -> GuardConfig {
        GuardConfig {
            audit_log: temp.path().join("incidents.jsonl"),
            signature_store: temp.path().join("signatures.json"),
            site_packages: vec![temp.path().join("site")],
            disable_integrity_check: true,
            no_capture: true,
            ..GuardConfig::default()
        }
    }

    fn orchestrator(config: GuardConfig) -> SealingOrchestrator {
        SealingOrchestrator::new(config)
            .install_logging(false)
            .print_banner(false)
            .release_source(Arc::new(Offline))
            .customize(|builder| builder.index(Arc::new(NoIndex)))
    }

    #[test]
    fn test_secure_boot_seals_and_opens_gate() {
        let temp = TempDir::new().unwrap();
        let outcome = orchestrator(config(&temp)).run().unwrap();
        assert_eq!(outcome.report.mode, BootMode::Secure);
        assert!(outcome.identity.registry().is_sealed());
        assert!(outcome.identity.hooks_installed());
        assert!(outcome.identity.gate().is_open());
        assert_eq!(outcome.report.sealed.as_ref().map(|s| s.labels), Some(6));
        assert!(matches!(outcome.report.self_hash, Some(SelfHashOutcome::Offline { .. })));
        assert_eq!(outcome.report.patrol_threads, 0);
    }

    #[test]
    fn test_light_mode_skips_sealing() {
        let temp = TempDir::new().unwrap();
        let outcome = orchestrator(GuardConfig {
            light: true,
            ..config(&temp)
        })
        .run()
        .unwrap();
        assert!(!outcome.identity.registry().is_sealed());
        assert!(!outcome.identity.hooks_installed());
        assert!(outcome.identity.gate().is_open());
        assert!(outcome.report.sealed.is_none());
    }

    #[test]
    fn test_required_signatures_abort_boot() {
        let temp = TempDir::new().unwrap();
        let result = orchestrator(GuardConfig {
            require_signatures: true,
            ..config(&temp)
        })
        .run();
        assert!(result.is_err());
    }
}
