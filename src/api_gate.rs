// Import-time guard: until boot completes, only callers whose source lives
// under the allowed namespace may use the import API.

use crate::errors::{GuardError, GuardResult};
use std::panic::Location;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

#[derive(Debug)]
pub struct ApiGate {
    allowed_component: String,
    open: AtomicBool,
}

impl ApiGate {
    pub fn new(allowed_component: impl Into<String>) -> Self {
        Self {
            allowed_component: allowed_component.into(),
            open: AtomicBool::new(false),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Check the caller's source location. Callers that want their own
    /// caller checked must themselves be `#[track_caller]`.
    #[track_caller]
    pub fn enforce(&self, operation: &str) -> GuardResult<()> {
        self.enforce_at(operation, Location::caller())
    }

    pub fn enforce_at(&self, operation: &str, caller: &Location<'_>) -> GuardResult<()> {
        if self.is_open() || in_namespace(caller.file(), &self.allowed_component) {
            return Ok(());
        }
        warn!(
            message = "api used before boot completed",
            operation = %operation,
            caller = %caller.file(),
            line = caller.line()
        );
        Err(GuardError::api_locked(format!(
            "{operation} is unavailable until boot completes (called from {}:{})",
            caller.file(),
            caller.line()
        )))
    }
}

fn in_namespace(file: &str, component: &str) -> bool {
    Path::new(file)
        .components()
        .any(|part| part.as_os_str() == component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_gate_rejects_outside_caller() {
        let gate = ApiGate::new("standalone");
        let err = gate.enforce("import").unwrap_err();
        assert!(matches!(err, GuardError::ApiLocked { .. }));

        gate.open();
        assert!(gate.enforce("import").is_ok());
    }

    #[test]
    fn test_namespace_match_is_per_component() {
        assert!(in_namespace("src/standalone/runner.rs", "standalone"));
        assert!(!in_namespace("src/standalone_tools.rs", "standalone"));
        assert!(!in_namespace("src/api_gate.rs", "standalone"));
    }

    #[test]
    fn test_allowed_component_passes_while_closed() {
        let gate = ApiGate::new("src");
        assert!(gate.enforce("import").is_ok());
        assert!(!gate.is_open());
    }
}
