// Boot mode and per-process runtime flags

use crate::config_loader::GuardConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub const CHILD_ENV: &str = "DEPGATE_CHILD";
pub const PARENT_ID_ENV: &str = "DEPGATE_PARENT_ID";
pub const HARDENED_ENV: &str = "DEPGATE_HARDENED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Secure,
    Child,
    Standalone,
    Light,
    Debug,
}

impl BootMode {
    /// Precedence: child, standalone, light, debug, then secure.
    pub fn detect(config: &GuardConfig) -> Self {
        if config.child {
            BootMode::Child
        } else if config.standalone {
            BootMode::Standalone
        } else if config.light {
            BootMode::Light
        } else if config.debug {
            BootMode::Debug
        } else {
            BootMode::Secure
        }
    }

    /// Reduced-trust modes that forgo sealing entirely.
    pub fn skips_sealing(&self) -> bool {
        matches!(self, BootMode::Light | BootMode::Standalone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::Secure => "secure",
            BootMode::Child => "child",
            BootMode::Standalone => "standalone",
            BootMode::Light => "light",
            BootMode::Debug => "debug",
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the resolved mode and flags, derived once per process.
///
/// A child process builds its own instance from the environment it inherits;
/// nothing is shared with the parent beyond the correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    pub mode: BootMode,
    pub hardened: bool,
    pub parent_correlation_id: Option<String>,
    pub disable_integrity_check: bool,
    pub no_capture: bool,
    pub flags: BTreeMap<String, serde_json::Value>,
}

impl RuntimeConfig {
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            mode: BootMode::detect(config),
            hardened: config.hardened,
            parent_correlation_id: config.parent_id.clone(),
            disable_integrity_check: config.disable_integrity_check,
            no_capture: config.no_capture,
            flags: config.flags.clone(),
        }
    }

    /// Whether patrol loops actually run. The disable flag is ignored under
    /// hardened mode.
    pub fn patrol_enabled(&self) -> bool {
        self.hardened || !self.disable_integrity_check
    }

    pub fn is_child(&self) -> bool {
        self.mode == BootMode::Child
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}
