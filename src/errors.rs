//! Error taxonomy for the depgate runtime
//!
//! Every fallible operation in the crate returns [`GuardResult`]. The variants
//! are grouped by how the runtime reacts to them: tamper, integrity, policy and
//! entropy failures end the process (or its boot), while resolution, install
//! and network failures are recovered locally.

use std::fmt;
use thiserror::Error;

/// Main error type for the depgate runtime
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Frozen digest mismatch raised under hardened policy. The display form is
    /// the short user-facing message and never names the mismatching labels.
    #[error("{0}")]
    Tamper(TamperReport),

    #[error("Integrity violation: {message}")]
    Integrity { message: String },

    #[error("Security policy violation: {message}")]
    PolicyViolation { message: String },

    #[error("Entropy self-test failed: {message}")]
    Entropy { message: String },

    #[error("No module named '{name}'")]
    ModuleNotFound { name: String },

    #[error("Invalid module name '{name}': {reason}")]
    InvalidModuleName { name: String, reason: String },

    #[error("Sealed target '{label}' could not be resolved")]
    UnresolvedTarget { label: String },

    #[error("Runtime identity has not been sealed")]
    NotSealed,

    #[error("API locked: {message}")]
    ApiLocked { message: String },

    #[error("Installation failed: {distribution} - {message}")]
    Install {
        distribution: String,
        message: String,
    },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Network operation failed: {operation}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Cryptographic operation failed: {message}")]
    Crypto { message: String },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },
}

/// Type alias for Result with GuardError
pub type GuardResult<T> = Result<T, GuardError>;

/// Short, stack-free description of a detected tamper event.
///
/// Only hash prefixes and the incident id are exposed; the full diagnostic
/// payload stays in the incident log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TamperReport {
    pub incident_id: String,
    pub expected: String,
    pub found: String,
}

impl fmt::Display for TamperReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runtime integrity violation (incident {}): expected {}..., found {}...",
            self.incident_id,
            hash_prefix(&self.expected),
            hash_prefix(&self.found)
        )
    }
}

/// First twelve characters of a hex digest, used in user-facing messages.
pub fn hash_prefix(digest: &str) -> &str {
    let end = digest
        .char_indices()
        .nth(12)
        .map(|(idx, _)| idx)
        .unwrap_or(digest.len());
    &digest[..end]
}

impl GuardError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an integrity error
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create a security policy violation
    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation {
            message: message.into(),
        }
    }

    /// Create an entropy failure
    pub fn entropy(message: impl Into<String>) -> Self {
        Self::Entropy {
            message: message.into(),
        }
    }

    /// Create a module-not-found error
    pub fn module_not_found(name: impl Into<String>) -> Self {
        Self::ModuleNotFound { name: name.into() }
    }

    /// Create an invalid module name error
    pub fn invalid_module_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidModuleName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an API gate error
    pub fn api_locked(message: impl Into<String>) -> Self {
        Self::ApiLocked {
            message: message.into(),
        }
    }

    /// Create an install error
    pub fn install(distribution: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Install {
            distribution: distribution.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create a network error
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            source,
        }
    }

    /// Create a cryptographic error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Whether this error must end the process (or abort boot) rather than be
    /// handled by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GuardError::Tamper(_)
                | GuardError::Integrity { .. }
                | GuardError::PolicyViolation { .. }
                | GuardError::Entropy { .. }
                | GuardError::UnresolvedTarget { .. }
        )
    }

    /// Whether this error is an ordinary "module could not be found" failure
    /// that host code is expected to handle.
    pub fn is_module_not_found(&self) -> bool {
        matches!(self, GuardError::ModuleNotFound { .. })
    }
}

/// Helper trait for safe mutex operations
pub trait SafeLock<T: ?Sized> {
    /// Safely lock a mutex, returning a GuardError on poison
    fn safe_lock(&self) -> GuardResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> GuardResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| GuardError::MutexPoisoned {
            resource: "mutex".to_string(),
        })
    }
}

/// Helper trait for safe RwLock read operations
pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> GuardResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> GuardResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| GuardError::MutexPoisoned {
            resource: "rwlock_read".to_string(),
        })
    }
}

/// Helper trait for safe RwLock write operations
pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> GuardResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> GuardResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| GuardError::MutexPoisoned {
            resource: "rwlock_write".to_string(),
        })
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for GuardError {
    fn from(err: std::io::Error) -> Self {
        GuardError::io("io_operation", err)
    }
}

impl From<reqwest::Error> for GuardError {
    fn from(err: reqwest::Error) -> Self {
        GuardError::network("http_request", err)
    }
}

impl From<figment::Error> for GuardError {
    fn from(err: figment::Error) -> Self {
        GuardError::config(err.to_string())
    }
}
