//! The crate root re-exports a fixed set of names. Removing one breaks this
//! file at compile time.

use depgate::{
    load_config, BootMode, BootOutcome, BootReport, Escalation, GuardConfig, GuardError, GuardResult,
    IdentityRegistry, IdentityStrategy, ImportRequest, InstallOutcome, IntegrityStatus, Module, PatrolFailure,
    RuntimeIdentity, RuntimeIdentityBuilder, SealedIdentity, SealingOrchestrator, TamperReport, Watchdog,
};

#[allow(dead_code)]
struct Surface {
    boot_outcome: Option<BootOutcome>,
    boot_report: Option<BootReport>,
    escalation: Option<Escalation>,
    error: Option<GuardError>,
    result: Option<GuardResult<()>>,
    registry: Option<IdentityRegistry>,
    sealed: Option<SealedIdentity>,
    request: Option<ImportRequest>,
    outcome: Option<InstallOutcome>,
    status: Option<IntegrityStatus>,
    module: Option<Module>,
    failure: Option<PatrolFailure>,
    identity: Option<RuntimeIdentity>,
    builder: Option<RuntimeIdentityBuilder>,
    orchestrator: Option<SealingOrchestrator>,
    report: Option<TamperReport>,
    watchdog: Option<Watchdog>,
}

#[test]
fn root_exports_resolve() {
    assert_eq!(BootMode::detect(&GuardConfig::default()), BootMode::Secure);
    assert_eq!(IdentityStrategy::default(), IdentityStrategy::Address);
    let _: fn(Option<&std::path::Path>) -> GuardResult<GuardConfig> = load_config;
}
