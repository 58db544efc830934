//! Import interceptor.
//!
//! Two entry hooks (the generic import and the dotted-string import) and one
//! auto-install finder share an [`InterceptorCore`]. When resolution fails, the
//! core filters the name, consults the installed catalog and the package index,
//! re-verifies the calling hook against the sealed identity and only then runs
//! the package manager. A successful install is followed by exactly one retry;
//! any other outcome hands the original "module not found" back to the caller.

use crate::errors::{GuardError, GuardResult, SafeLock};
use crate::import_policy::{requirement, top_level, AllowDenyAliasLists, FilterVerdict};
use crate::installer::{DistributionCatalog, PackageInstaller};
use crate::namespace::{address_of, Guarded, AUTO_INSTALL_FINDER};
use crate::package_index::PackageIndex;
use crate::resolver::{Module, Resolver, ResolverChain};
use crate::runtime_identity::RuntimeIdentity;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const SOURCE: &str = include_str!("interceptor.rs");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub name: String,
    /// Exact version to pin if an install happens.
    pub version: Option<String>,
}

impl ImportRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn pinned(name: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.map(str::to_string),
        }
    }
}

/// An import entry point.
pub trait ImportHook: Guarded {
    fn call(&self, request: &ImportRequest, identity: &RuntimeIdentity) -> GuardResult<Module>;
}

/// The unwrapped entry point: plain resolution through the chain.
#[derive(Debug, Default)]
pub struct OriginalImport;

impl Guarded for OriginalImport {
    fn source(&self) -> &'static str {
        SOURCE
    }
}

impl ImportHook for OriginalImport {
    fn call(&self, request: &ImportRequest, identity: &RuntimeIdentity) -> GuardResult<Module> {
        identity.resolvers().resolve(&request.name, identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Filtered(FilterVerdict),
    AlreadyInstalled,
    NotOnIndex,
    PreviouslyAttempted,
    IdentityUnverified,
    InstallFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Filtered(verdict) => f.write_str(verdict.reason()),
            SkipReason::AlreadyInstalled => f.write_str("distribution already installed"),
            SkipReason::NotOnIndex => f.write_str("not found on package index"),
            SkipReason::PreviouslyAttempted => f.write_str("install already attempted in this process"),
            SkipReason::IdentityUnverified => f.write_str("interceptor identity could not be verified"),
            SkipReason::InstallFailed => f.write_str("package manager failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { requirement: String },
    Skipped(SkipReason),
}

/// State shared by both entry hooks and the finder.
pub struct InterceptorCore {
    lists: AllowDenyAliasLists,
    index: Arc<dyn PackageIndex>,
    installer: Arc<dyn PackageInstaller>,
    catalog: Arc<dyn DistributionCatalog>,
    verify_index: bool,
    /// Distributions already sent to the index or installer, by lowercase name.
    attempted: Mutex<HashSet<String>>,
}

impl fmt::Debug for InterceptorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorCore")
            .field("lists", &self.lists)
            .field("verify_index", &self.verify_index)
            .finish_non_exhaustive()
    }
}

impl InterceptorCore {
    pub fn new(
        lists: AllowDenyAliasLists,
        index: Arc<dyn PackageIndex>,
        installer: Arc<dyn PackageInstaller>,
        catalog: Arc<dyn DistributionCatalog>,
        verify_index: bool,
    ) -> Self {
        Self {
            lists,
            index,
            installer,
            catalog,
            verify_index,
            attempted: Mutex::new(HashSet::new()),
        }
    }

    pub fn lists(&self) -> &AllowDenyAliasLists {
        &self.lists
    }

    /// Claim `distribution` for this attempt. False when another attempt,
    /// finished or still running, already holds it.
    fn claim(&self, distribution: &str) -> GuardResult<bool> {
        Ok(self.attempted.safe_lock()?.insert(distribution.to_ascii_lowercase()))
    }

    /// Decide whether `name` may be installed and, if so, install it.
    ///
    /// `label` and `caller` identify the executing hook; both it and the
    /// binding under `label` must still match the sealed identity. Only a
    /// hardened tamper (or a poisoned lock) is returned as an error.
    pub fn attempt_install(
        &self,
        name: &str,
        version: Option<&str>,
        label: &'static str,
        caller: &dyn Guarded,
        identity: &RuntimeIdentity,
    ) -> GuardResult<InstallOutcome> {
        let verdict = self.lists.evaluate(name);
        if verdict != FilterVerdict::Proceed {
            debug!(message = "auto-install skipped", name = %name, reason = verdict.reason());
            return Ok(InstallOutcome::Skipped(SkipReason::Filtered(verdict)));
        }

        let top = top_level(name);
        if self.catalog.is_installed(top) {
            debug!(message = "distribution already installed; not masking import failure", name = %name, top = %top);
            return Ok(InstallOutcome::Skipped(SkipReason::AlreadyInstalled));
        }

        let distribution = self.lists.distribution_for(name);
        if !self.claim(&distribution)? {
            debug!(message = "auto-install skipped", distribution = %distribution, reason = "previously attempted");
            return Ok(InstallOutcome::Skipped(SkipReason::PreviouslyAttempted));
        }

        if self.verify_index {
            let started = Instant::now();
            let exists = self.index.distribution_exists(&distribution);
            debug!(
                message = "package index checked",
                distribution = %distribution,
                exists,
                elapsed_ms = started.elapsed().as_millis() as u64
            );
            if !exists {
                warn!(message = "distribution not found on package index; not installing", distribution = %distribution);
                return Ok(InstallOutcome::Skipped(SkipReason::NotOnIndex));
            }
        }

        if !identity.verify_hook(label, caller)? {
            return Ok(InstallOutcome::Skipped(SkipReason::IdentityUnverified));
        }

        let requirement = requirement(&distribution, version);
        let started = Instant::now();
        match self.installer.install(&requirement) {
            Ok(()) => {
                info!(
                    message = "distribution installed",
                    requirement = %requirement,
                    name = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64
                );
                Ok(InstallOutcome::Installed { requirement })
            }
            Err(e) => {
                warn!(message = "install failed", requirement = %requirement, error = %e);
                Ok(InstallOutcome::Skipped(SkipReason::InstallFailed))
            }
        }
    }
}

/// Wraps an entry point: resolution failures go through the install path.
pub struct PatchedImport {
    label: &'static str,
    core: Arc<InterceptorCore>,
}

impl PatchedImport {
    pub fn new(label: &'static str, core: Arc<InterceptorCore>) -> Self {
        Self { label, core }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Debug for PatchedImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchedImport").field("label", &self.label).finish()
    }
}

impl Guarded for PatchedImport {
    fn source(&self) -> &'static str {
        SOURCE
    }
}

impl ImportHook for PatchedImport {
    fn call(&self, request: &ImportRequest, identity: &RuntimeIdentity) -> GuardResult<Module> {
        let chain = identity.resolvers();
        // A pinned request must not be satisfied by an unpinned finder install.
        let first = if request.version.is_some() {
            chain.resolve_passive(&request.name, identity)
        } else {
            chain.resolve(&request.name, identity)
        };

        let original = match first {
            Err(e) if e.is_module_not_found() => e,
            other => return other,
        };

        warn!(
            message = "import failed; attempting auto-install",
            hook = self.label,
            name = %request.name,
            since_start = identity.clock().since_start()
        );
        match self.core.attempt_install(
            &request.name,
            request.version.as_deref(),
            self.label,
            self,
            identity,
        )? {
            InstallOutcome::Installed { .. } => chain.resolve_passive(&request.name, identity),
            InstallOutcome::Skipped(reason) => {
                debug!(message = "propagating original import failure", name = %request.name, reason = %reason);
                Err(original)
            }
        }
    }
}

/// Resolver inserted at the front of the chain. It takes itself out of the
/// chain while it works so the nested resolution cannot re-enter it.
pub struct AutoInstallFinder {
    core: Arc<InterceptorCore>,
}

impl AutoInstallFinder {
    pub fn new(core: Arc<InterceptorCore>) -> Self {
        Self { core }
    }
}

impl fmt::Debug for AutoInstallFinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoInstallFinder").finish_non_exhaustive()
    }
}

impl Guarded for AutoInstallFinder {
    fn source(&self) -> &'static str {
        SOURCE
    }
}

/// Puts the finder back at the front of the chain when dropped, if it was
/// this guard that took it out.
struct Detached<'a> {
    chain: &'a ResolverChain,
    finder: Option<Arc<dyn Resolver>>,
}

impl<'a> Detached<'a> {
    fn new(chain: &'a ResolverChain, target: usize) -> GuardResult<Self> {
        Ok(Self {
            chain,
            finder: chain.take(target)?,
        })
    }
}

impl Drop for Detached<'_> {
    fn drop(&mut self) {
        if let Some(finder) = self.finder.take() {
            if let Err(e) = self.chain.insert_front(finder) {
                error!(message = "failed to reattach auto-install finder", error = %e);
            }
        }
    }
}

impl Resolver for AutoInstallFinder {
    fn find(&self, name: &str, identity: &RuntimeIdentity) -> GuardResult<Option<Module>> {
        let chain = identity.resolvers();
        let _detached = Detached::new(chain, address_of(self))?;

        match chain.resolve_passive(name, identity) {
            Ok(module) => return Ok(Some(module)),
            Err(e) if e.is_module_not_found() => {}
            Err(e) => return Err(e),
        }

        match self
            .core
            .attempt_install(name, None, AUTO_INSTALL_FINDER, self, identity)?
        {
            InstallOutcome::Installed { .. } => match chain.resolve_passive(name, identity) {
                Ok(module) => Ok(Some(module)),
                Err(e) if e.is_module_not_found() => Ok(None),
                Err(e) => Err(e),
            },
            InstallOutcome::Skipped(_) => Ok(None),
        }
    }

    fn auto_installs(&self) -> bool {
        true
    }
}

/// Resolve a leading-dot name against `package`. One dot is the package
/// itself; each further dot climbs one level.
pub fn resolve_relative(name: &str, package: Option<&str>) -> GuardResult<String> {
    let rest = name.trim_start_matches('.');
    let level = name.len() - rest.len();
    if level == 0 {
        return Ok(name.to_string());
    }

    let package = package.filter(|p| !p.is_empty()).ok_or_else(|| {
        GuardError::invalid_module_name(name, "relative import requires an anchor package")
    })?;
    let parts: Vec<&str> = package.split('.').collect();
    if level > parts.len() {
        return Err(GuardError::invalid_module_name(
            name,
            "relative import beyond top-level package",
        ));
    }
    let base = parts[..parts.len() - (level - 1)].join(".");
    Ok(if rest.is_empty() {
        base
    } else {
        format!("{base}.{rest}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative() {
        assert_eq!(resolve_relative("requests", None).unwrap(), "requests");
        assert_eq!(resolve_relative(".utils", Some("app.core")).unwrap(), "app.core.utils");
        assert_eq!(resolve_relative("..utils", Some("app.core")).unwrap(), "app.utils");
        assert_eq!(resolve_relative(".", Some("app.core")).unwrap(), "app.core");
        assert!(matches!(
            resolve_relative(".utils", None),
            Err(GuardError::InvalidModuleName { .. })
        ));
        assert!(resolve_relative("...x", Some("app.core")).is_err());
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(
            SkipReason::Filtered(FilterVerdict::Builtin).to_string(),
            "builtin module"
        );
        assert_eq!(SkipReason::NotOnIndex.to_string(), "not found on package index");
    }

    #[test]
    fn test_pinned_request() {
        let request = ImportRequest::pinned("requests", Some("2.31.0"));
        assert_eq!(request.version.as_deref(), Some("2.31.0"));
        assert_eq!(ImportRequest::new("x").version, None);
    }
}
