//! Live label table holding the objects whose identity is sealed.
//!
//! Every security-relevant object (the two import entry hooks, the
//! auto-install finder, the patrol routines and the log capture sink) is bound
//! here under a dotted label. Sealing records the identity of whatever is bound
//! at that instant; checks re-read the table and compare. Rebinding a label is
//! exactly the replacement an attacker would perform, and what the patrol is
//! built to notice.

use crate::errors::{GuardResult, SafeReadLock, SafeWriteLock};
use crate::interceptor::ImportHook;
use crate::patrol::PatrolRoutine;
use crate::resolver::Resolver;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

pub const PATCHED_IMPORT: &str = "importer.patched_import";
pub const PATCHED_IMPORT_MODULE: &str = "importer.patched_import_module";
pub const AUTO_INSTALL_FINDER: &str = "importer.auto_install_finder";
pub const CAPTURE_SINK: &str = "logit.capture_sink";
pub const INTEGRITY_PATROL: &str = "integrity.background_integrity_patrol";
pub const ENTROPY_CHECK: &str = "integrity.background_entropy_check";

/// Labels sealed at boot, in the order they are resolved.
pub const SEALED_TARGETS: [&str; 6] = [
    PATCHED_IMPORT,
    PATCHED_IMPORT_MODULE,
    AUTO_INSTALL_FINDER,
    CAPTURE_SINK,
    INTEGRITY_PATROL,
    ENTROPY_CHECK,
];

/// An object whose identity can be sealed.
///
/// `source` is the text the object was compiled from, normally
/// `include_str!` of its own module; it feeds structural fingerprints and the
/// signature store.
pub trait Guarded: Send + Sync {
    fn qualified_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn source(&self) -> &'static str;
}

/// Address of the object behind a reference, used as its identity handle.
pub fn address_of<T: ?Sized>(object: &T) -> usize {
    object as *const T as *const () as usize
}

#[derive(Clone)]
pub enum Binding {
    Hook(Arc<dyn ImportHook>),
    Finder(Arc<dyn Resolver>),
    Routine(Arc<dyn PatrolRoutine>),
    Sink(Arc<dyn Guarded>),
}

impl Binding {
    pub fn address(&self) -> usize {
        match self {
            Binding::Hook(hook) => Arc::as_ptr(hook) as *const () as usize,
            Binding::Finder(finder) => Arc::as_ptr(finder) as *const () as usize,
            Binding::Routine(routine) => Arc::as_ptr(routine) as *const () as usize,
            Binding::Sink(sink) => Arc::as_ptr(sink) as *const () as usize,
        }
    }

    pub fn qualified_name(&self) -> &'static str {
        match self {
            Binding::Hook(hook) => hook.qualified_name(),
            Binding::Finder(finder) => finder.qualified_name(),
            Binding::Routine(routine) => routine.qualified_name(),
            Binding::Sink(sink) => sink.qualified_name(),
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Binding::Hook(hook) => hook.source(),
            Binding::Finder(finder) => finder.source(),
            Binding::Routine(routine) => routine.source(),
            Binding::Sink(sink) => sink.source(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Binding::Hook(_) => "hook",
            Binding::Finder(_) => "finder",
            Binding::Routine(_) => "routine",
            Binding::Sink(_) => "sink",
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &self.kind())
            .field("type", &self.qualified_name())
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Namespace {
    slots: RwLock<BTreeMap<String, Binding>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `label`, returning whatever was bound there before.
    pub fn bind(&self, label: impl Into<String>, binding: Binding) -> GuardResult<Option<Binding>> {
        Ok(self.slots.safe_write()?.insert(label.into(), binding))
    }

    pub fn unbind(&self, label: &str) -> GuardResult<Option<Binding>> {
        Ok(self.slots.safe_write()?.remove(label))
    }

    pub fn get(&self, label: &str) -> GuardResult<Option<Binding>> {
        Ok(self.slots.safe_read()?.get(label).cloned())
    }

    pub fn hook(&self, label: &str) -> GuardResult<Option<Arc<dyn ImportHook>>> {
        Ok(match self.get(label)? {
            Some(Binding::Hook(hook)) => Some(hook),
            _ => None,
        })
    }

    pub fn finder(&self, label: &str) -> GuardResult<Option<Arc<dyn Resolver>>> {
        Ok(match self.get(label)? {
            Some(Binding::Finder(finder)) => Some(finder),
            _ => None,
        })
    }

    pub fn routine(&self, label: &str) -> GuardResult<Option<Arc<dyn PatrolRoutine>>> {
        Ok(match self.get(label)? {
            Some(Binding::Routine(routine)) => Some(routine),
            _ => None,
        })
    }

    pub fn labels(&self) -> GuardResult<Vec<String>> {
        Ok(self.slots.safe_read()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    impl Guarded for Marker {
        fn source(&self) -> &'static str {
            "marker"
        }
    }

    #[test]
    fn test_rebinding_changes_address() {
        let namespace = Namespace::new();
        let first: Arc<dyn Guarded> = Arc::new(Marker);
        let second: Arc<dyn Guarded> = Arc::new(Marker);

        assert!(namespace.bind(CAPTURE_SINK, Binding::Sink(first.clone())).unwrap().is_none());
        let before = namespace.get(CAPTURE_SINK).unwrap().unwrap().address();
        assert_eq!(before, address_of(first.as_ref()));

        let previous = namespace.bind(CAPTURE_SINK, Binding::Sink(second)).unwrap();
        assert!(previous.is_some());
        let after = namespace.get(CAPTURE_SINK).unwrap().unwrap().address();
        assert_ne!(before, after);
    }

    #[test]
    fn test_qualified_name_is_concrete_type() {
        let sink = Binding::Sink(Arc::new(Marker));
        assert!(sink.qualified_name().ends_with("Marker"));
        assert_eq!(sink.source(), "marker");
    }

    #[test]
    fn test_typed_lookup_rejects_other_kinds() {
        let namespace = Namespace::new();
        namespace.bind(PATCHED_IMPORT, Binding::Sink(Arc::new(Marker))).unwrap();
        assert!(namespace.hook(PATCHED_IMPORT).unwrap().is_none());
        assert!(namespace.finder("missing").unwrap().is_none());
        assert_eq!(namespace.labels().unwrap(), vec![PATCHED_IMPORT.to_string()]);

        namespace.unbind(PATCHED_IMPORT).unwrap();
        assert!(namespace.get(PATCHED_IMPORT).unwrap().is_none());
    }
}
