//! The per-process runtime identity.
//!
//! One explicitly constructed context owns everything the orchestrator,
//! interceptor and patrol share: the live namespace, the sealed registry, the
//! resolver chain, the two import entry points, the incident log and the API
//! gate. Hooks and patrol routines receive it by reference rather than holding
//! it. A child process builds its own from the environment it inherits.

use crate::api_gate::ApiGate;
use crate::boot_capture::BootCapture;
use crate::clock::Clock;
use crate::config_loader::GuardConfig;
use crate::errors::{GuardError, GuardResult, SafeReadLock, SafeWriteLock};
use crate::fingerprint::SystemFingerprint;
use crate::identity::{IdentityComparison, IdentityRegistry, IdentityStrategy, SealedIdentity};
use crate::import_policy::{normalize_version, validate_literal_name, AllowDenyAliasLists};
use crate::incident::{Incident, IncidentKind, IncidentLog};
use crate::installer::{discover_site_packages, DistributionCatalog, PackageInstaller, PipInstaller, SitePackagesCatalog};
use crate::interceptor::{
    resolve_relative, AutoInstallFinder, ImportHook, ImportRequest, InterceptorCore, OriginalImport, PatchedImport,
};
use crate::namespace::{
    address_of, Binding, Guarded, Namespace, AUTO_INSTALL_FINDER, CAPTURE_SINK, ENTROPY_CHECK, INTEGRITY_PATROL,
    PATCHED_IMPORT, PATCHED_IMPORT_MODULE,
};
use crate::package_index::{PackageIndex, PyPiIndex};
use crate::patrol::{EntropyCheck, EntropySource, IntegrityPatrol, OsEntropy};
use crate::resolver::{BuiltinResolver, Module, Resolver, ResolverChain, SitePackagesResolver};
use crate::runtime_config::{RuntimeConfig, CHILD_ENV, HARDENED_ENV, PARENT_ID_ENV};
use std::ffi::OsStr;
use std::fmt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a non-fatal integrity check.
#[derive(Debug, Clone)]
pub enum IntegrityStatus {
    Clean { elapsed: Duration },
    Mismatch(IdentityComparison),
}

impl IntegrityStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, IntegrityStatus::Clean { .. })
    }
}

struct EntryPoints {
    import: RwLock<Arc<dyn ImportHook>>,
    import_module: RwLock<Arc<dyn ImportHook>>,
}

pub struct RuntimeIdentity {
    correlation_id: String,
    runtime: RuntimeConfig,
    config: Arc<GuardConfig>,
    clock: Clock,
    namespace: Namespace,
    registry: IdentityRegistry,
    resolvers: ResolverChain,
    entry_points: EntryPoints,
    interceptor: Arc<InterceptorCore>,
    incidents: IncidentLog,
    gate: ApiGate,
    entropy: Arc<dyn EntropySource>,
    hooks_installed: AtomicBool,
    fingerprint: OnceLock<SystemFingerprint>,
}

impl fmt::Debug for RuntimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeIdentity")
            .field("correlation_id", &self.correlation_id)
            .field("runtime", &self.runtime)
            .field("sealed", &self.registry.is_sealed())
            .field("hooks_installed", &self.hooks_installed())
            .field("resolvers", &self.resolvers)
            .finish_non_exhaustive()
    }
}

impl RuntimeIdentity {
    pub fn builder(config: GuardConfig) -> RuntimeIdentityBuilder {
        RuntimeIdentityBuilder::new(config)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn guard_config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// The live chain. Outside the crate resolution goes through the sealed
    /// hooks in the namespace.
    pub(crate) fn resolvers(&self) -> &ResolverChain {
        &self.resolvers
    }

    pub fn interceptor(&self) -> &InterceptorCore {
        &self.interceptor
    }

    pub fn incidents(&self) -> &IncidentLog {
        &self.incidents
    }

    pub fn gate(&self) -> &ApiGate {
        &self.gate
    }

    pub fn entropy(&self) -> &dyn EntropySource {
        self.entropy.as_ref()
    }

    pub fn fingerprint(&self) -> &SystemFingerprint {
        self.fingerprint.get_or_init(SystemFingerprint::collect)
    }

    pub fn seal(&self) -> GuardResult<&SealedIdentity> {
        self.registry.seal(&self.namespace, &self.correlation_id, &self.clock)
    }

    /// Compare the live namespace with the sealed digest and apply policy:
    /// hardened mode turns a mismatch into a tamper error, otherwise the
    /// mismatch is logged with the offending labels and returned.
    pub fn check_integrity(&self) -> GuardResult<IntegrityStatus> {
        let comparison = self.registry.compare(&self.namespace)?;
        if comparison.is_clean() {
            debug!(message = "integrity check clean", elapsed_us = comparison.elapsed.as_micros() as u64);
            return Ok(IntegrityStatus::Clean {
                elapsed: comparison.elapsed,
            });
        }

        let labels: Vec<String> = comparison
            .mismatched_labels()
            .into_iter()
            .map(str::to_string)
            .collect();
        let incident = self.record_incident(
            IncidentKind::IdentityMismatch,
            comparison.expected.clone(),
            comparison.found.clone(),
            labels,
        );

        if self.runtime.hardened {
            error!(message = "sealed identity mismatch", incident_id = %incident.incident_id);
            return Err(GuardError::Tamper(incident.report()));
        }
        if !self.runtime.disable_integrity_check {
            for mismatch in &comparison.mismatched {
                warn!(
                    message = "sealed identity mismatch",
                    label = %mismatch.label,
                    expected = mismatch.expected,
                    found = ?mismatch.found,
                    incident_id = %incident.incident_id
                );
            }
        }
        Ok(IntegrityStatus::Mismatch(comparison))
    }

    /// Verify that `caller`, running as `label`, is the sealed object and that
    /// the namespace still binds it. `Ok(false)` means "do not proceed".
    pub fn verify_hook(&self, label: &str, caller: &dyn Guarded) -> GuardResult<bool> {
        let Some(expected) = self.registry.sealed_handle(label) else {
            warn!(message = "identity not sealed; auto-install refused", label = %label);
            return Ok(false);
        };

        let strategy = self.registry.strategy();
        let running = strategy.handle(address_of(caller), caller.qualified_name(), caller.source());
        let bound = self
            .namespace
            .get(label)?
            .map(|binding| strategy.handle_of(&binding));
        if running == expected && bound == Some(expected) {
            return Ok(true);
        }

        let found = if running != expected {
            running
        } else {
            bound.unwrap_or_default()
        };
        let incident = self.record_incident(
            IncidentKind::HookMismatch,
            format!("{expected:016x}"),
            format!("{found:016x}"),
            vec![label.to_string()],
        );
        if self.runtime.hardened {
            error!(message = "interceptor identity mismatch", incident_id = %incident.incident_id);
            return Err(GuardError::Tamper(incident.report()));
        }
        warn!(
            message = "interceptor identity mismatch; auto-install aborted",
            label = %label,
            expected = expected,
            running = running,
            bound = ?bound,
            incident_id = %incident.incident_id
        );
        Ok(false)
    }

    /// Build and append an incident. Failing to write the audit log is
    /// logged and never masks the event itself.
    pub fn record_incident(
        &self,
        kind: IncidentKind,
        expected: impl Into<String>,
        found: impl Into<String>,
        labels: Vec<String>,
    ) -> Incident {
        let incident = Incident::new(kind, expected, found, &self.correlation_id, labels);
        if let Err(e) = self.incidents.record(&incident) {
            error!(
                message = "failed to write audit log",
                path = %self.incidents.path().display(),
                error = %e
            );
        }
        incident
    }

    /// Point both entry points at the sealed hooks and put the finder at the
    /// front of the chain. Requires a sealed identity; idempotent.
    pub fn install_hooks(&self) -> GuardResult<()> {
        if !self.registry.is_sealed() {
            return Err(GuardError::NotSealed);
        }
        if self.hooks_installed() {
            return Ok(());
        }

        let unresolved = |label: &str| GuardError::UnresolvedTarget {
            label: label.to_string(),
        };
        let import = self
            .namespace
            .hook(PATCHED_IMPORT)?
            .ok_or_else(|| unresolved(PATCHED_IMPORT))?;
        let import_module = self
            .namespace
            .hook(PATCHED_IMPORT_MODULE)?
            .ok_or_else(|| unresolved(PATCHED_IMPORT_MODULE))?;
        let finder = self
            .namespace
            .finder(AUTO_INSTALL_FINDER)?
            .ok_or_else(|| unresolved(AUTO_INSTALL_FINDER))?;

        *self.entry_points.import.safe_write()? = import;
        *self.entry_points.import_module.safe_write()? = import_module;
        self.resolvers.insert_front(finder)?;
        self.hooks_installed.store(true, Ordering::Release);

        info!(message = "import hooks installed", correlation_id = %self.correlation_id);
        Ok(())
    }

    pub fn hooks_installed(&self) -> bool {
        self.hooks_installed.load(Ordering::Acquire)
    }

    /// Open the API gate.
    pub fn mark_boot_complete(&self) {
        self.gate.open();
    }

    /// Generic import entry point.
    #[track_caller]
    pub fn import(&self, name: &str) -> GuardResult<Module> {
        self.gate.enforce("import")?;
        let hook = self.entry_points.import.safe_read()?.clone();
        hook.call(&ImportRequest::new(name), self)
    }

    /// Dotted-string import entry point. Names starting with `.` are resolved
    /// against `package`.
    #[track_caller]
    pub fn import_module(&self, name: &str, package: Option<&str>) -> GuardResult<Module> {
        self.gate.enforce("import_module")?;
        let absolute = resolve_relative(name, package)?;
        let hook = self.entry_points.import_module.safe_read()?.clone();
        hook.call(&ImportRequest::new(absolute), self)
    }

    /// Import with an optional version pin. Only string literals are
    /// accepted; a malformed name or version is a policy violation.
    #[track_caller]
    pub fn jit_import(&self, name: &'static str, version: &'static str) -> GuardResult<Module> {
        self.gate.enforce("jit_import")?;
        let pinned = match validate_literal_name(name).and_then(|()| normalize_version(version)) {
            Ok(pinned) => pinned,
            Err(e) => {
                let incident = self.record_incident(
                    IncidentKind::PolicyViolation,
                    "literal module name",
                    name.escape_default().to_string(),
                    vec!["jit_import".to_string()],
                );
                error!(message = "jit_import policy violation", incident_id = %incident.incident_id);
                return Err(e);
            }
        };
        let hook = self.entry_points.import.safe_read()?.clone();
        hook.call(&ImportRequest::pinned(name, pinned), self)
    }

    /// Command for a child process that seals its own identity, tagged with
    /// this process's correlation id.
    pub fn child_command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut command = Command::new(program);
        command
            .env(CHILD_ENV, "1")
            .env(PARENT_ID_ENV, &self.correlation_id);
        if self.runtime.hardened {
            command.env(HARDENED_ENV, "1");
        }
        command
    }
}

/// Assembles a [`RuntimeIdentity`]; every collaborator with side effects
/// can be substituted.
pub struct RuntimeIdentityBuilder {
    config: GuardConfig,
    correlation_id: Option<String>,
    strategy: IdentityStrategy,
    clock: Option<Clock>,
    index: Option<Arc<dyn PackageIndex>>,
    installer: Option<Arc<dyn PackageInstaller>>,
    catalog: Option<Arc<dyn DistributionCatalog>>,
    resolvers: Option<Vec<Arc<dyn Resolver>>>,
    entropy: Option<Arc<dyn EntropySource>>,
    capture: Option<BootCapture>,
}

impl RuntimeIdentityBuilder {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            correlation_id: None,
            strategy: IdentityStrategy::default(),
            clock: None,
            index: None,
            installer: None,
            catalog: None,
            resolvers: None,
            entropy: None,
            capture: None,
        }
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn strategy(mut self, strategy: IdentityStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn index(mut self, index: Arc<dyn PackageIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn DistributionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace the base resolvers (built-in names and site-packages).
    pub fn resolvers(mut self, resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        self.resolvers = Some(resolvers);
        self
    }

    pub fn entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = Some(entropy);
        self
    }

    pub fn capture(mut self, capture: BootCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn build(self) -> GuardResult<RuntimeIdentity> {
        let config = self.config;
        config.validate()?;
        let runtime = RuntimeConfig::from_config(&config);

        let needs_roots = self.resolvers.is_none() || self.catalog.is_none();
        let roots = if !config.site_packages.is_empty() {
            config.site_packages.clone()
        } else if needs_roots {
            discover_site_packages(&config.python)
        } else {
            Vec::new()
        };

        let index: Arc<dyn PackageIndex> = match self.index {
            Some(index) => index,
            None => Arc::new(PyPiIndex::new(config.index_url.clone(), config.network_timeout())?),
        };
        let installer = self
            .installer
            .unwrap_or_else(|| Arc::new(PipInstaller::new(config.python.clone(), config.verbose_install)));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(SitePackagesCatalog::new(roots.clone())));
        let resolvers = self.resolvers.unwrap_or_else(|| {
            vec![
                Arc::new(BuiltinResolver) as Arc<dyn Resolver>,
                Arc::new(SitePackagesResolver::new(roots)),
            ]
        });

        let interceptor = Arc::new(InterceptorCore::new(
            AllowDenyAliasLists::from_config(&config),
            index,
            installer,
            catalog,
            config.verify_index,
        ));

        let capture = self
            .capture
            .unwrap_or_else(|| BootCapture::new(false));
        let namespace = Namespace::new();
        namespace.bind(
            PATCHED_IMPORT,
            Binding::Hook(Arc::new(PatchedImport::new(PATCHED_IMPORT, Arc::clone(&interceptor)))),
        )?;
        namespace.bind(
            PATCHED_IMPORT_MODULE,
            Binding::Hook(Arc::new(PatchedImport::new(
                PATCHED_IMPORT_MODULE,
                Arc::clone(&interceptor),
            ))),
        )?;
        namespace.bind(
            AUTO_INSTALL_FINDER,
            Binding::Finder(Arc::new(AutoInstallFinder::new(Arc::clone(&interceptor)))),
        )?;
        namespace.bind(CAPTURE_SINK, Binding::Sink(capture.sink()))?;
        namespace.bind(INTEGRITY_PATROL, Binding::Routine(Arc::new(IntegrityPatrol)))?;
        namespace.bind(ENTROPY_CHECK, Binding::Routine(Arc::new(EntropyCheck)))?;

        let original: Arc<dyn ImportHook> = Arc::new(OriginalImport);
        let correlation_id = self
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(RuntimeIdentity {
            correlation_id,
            runtime,
            clock: self.clock.unwrap_or_default(),
            namespace,
            registry: IdentityRegistry::with_strategy(self.strategy),
            resolvers: ResolverChain::new(resolvers),
            entry_points: EntryPoints {
                import: RwLock::new(Arc::clone(&original)),
                import_module: RwLock::new(original),
            },
            interceptor,
            incidents: IncidentLog::new(config.audit_log.clone()),
            gate: ApiGate::new(config.allowed_namespace.clone()),
            entropy: self.entropy.unwrap_or_else(|| Arc::new(OsEntropy)),
            hooks_installed: AtomicBool::new(false),
            fingerprint: OnceLock::new(),
            config: Arc::new(config),
        })
    }
}
