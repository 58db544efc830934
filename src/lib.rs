//! Library root for the `depgate` crate.
//!
//! A runtime dependency gatekeeper: seals the identity of its own import
//! hooks at boot, intercepts imports to auto-install missing packages under
//! an allow/deny policy, and patrols the sealed identities for the life of
//! the process.

// Core error handling
pub mod errors;

// Configuration & boot mode
pub mod config_loader;
pub mod runtime_config;

// Timing
pub mod clock;

// Identity & sealing
pub mod identity;
pub mod namespace;
pub mod runtime_identity;

// Import interception
pub mod import_policy;
pub mod installer;
pub mod interceptor;
pub mod package_index;
pub mod resolver;

// Patrol & incidents
pub mod fingerprint;
pub mod incident;
pub mod patrol;

// Self-integrity
pub mod self_hash;
pub mod sigverify;

// Boot sequence
pub mod api_gate;
pub mod boot;
pub mod boot_capture;
pub mod bootwall;

// CLI
pub mod cli;

pub use boot::{BootOutcome, BootReport, SealingOrchestrator};
pub use config_loader::{load_config, GuardConfig};
pub use errors::{GuardError, GuardResult, TamperReport};
pub use identity::{IdentityRegistry, IdentityStrategy, SealedIdentity};
pub use interceptor::{ImportRequest, InstallOutcome};
pub use patrol::{Escalation, PatrolFailure, Watchdog};
pub use resolver::Module;
pub use runtime_config::BootMode;
pub use runtime_identity::{IntegrityStatus, RuntimeIdentity, RuntimeIdentityBuilder};
