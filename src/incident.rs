//! Tamper incidents and the append-only audit log.

use crate::errors::{GuardError, GuardResult, SafeLock, TamperReport};
use crate::fingerprint::ProcessFingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    IdentityMismatch,
    HookMismatch,
    SelfHashMismatch,
    SignatureFailure,
    EntropyFailure,
    PolicyViolation,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::IdentityMismatch => "identity_mismatch",
            IncidentKind::HookMismatch => "hook_mismatch",
            IncidentKind::SelfHashMismatch => "self_hash_mismatch",
            IncidentKind::SignatureFailure => "signature_failure",
            IncidentKind::EntropyFailure => "entropy_failure",
            IncidentKind::PolicyViolation => "policy_violation",
        }
    }
}

/// One detected tamper or violation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub kind: IncidentKind,
    pub expected: String,
    pub found: String,
    pub fingerprint: ProcessFingerprint,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    /// Labels involved; written to the log, never shown in fatal messages.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Incident {
    pub fn new(
        kind: IncidentKind,
        expected: impl Into<String>,
        found: impl Into<String>,
        correlation_id: impl Into<String>,
        labels: Vec<String>,
    ) -> Self {
        let expected = expected.into();
        let found = found.into();
        let correlation_id = correlation_id.into();
        Self {
            incident_id: incident_id(kind, &expected, &found, &correlation_id),
            kind,
            expected,
            found,
            fingerprint: ProcessFingerprint::current(),
            timestamp: Utc::now(),
            correlation_id,
            labels,
        }
    }

    /// The short form handed to users.
    pub fn report(&self) -> TamperReport {
        TamperReport {
            incident_id: self.incident_id.clone(),
            expected: self.expected.clone(),
            found: self.found.clone(),
        }
    }
}

/// `INC-` plus 16 hex chars of SHA-256 over kind, both digests and the
/// correlation id. The same failure repeated yields the same id.
pub fn incident_id(kind: IncidentKind, expected: &str, found: &str, correlation_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [kind.as_str(), expected, found, correlation_id] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("INC-{}", &digest[..16])
}

/// JSON-lines audit log, deduplicated by incident id within the process.
#[derive(Debug)]
pub struct IncidentLog {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl IncidentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `incident` unless its id was already written by this process.
    /// Returns whether a line was written.
    pub fn record(&self, incident: &Incident) -> GuardResult<bool> {
        let mut seen = self.seen.safe_lock()?;
        if seen.contains(&incident.incident_id) {
            debug!(message = "duplicate incident suppressed", incident_id = %incident.incident_id);
            return Ok(false);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| GuardError::io("creating audit log directory", e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GuardError::io("opening audit log", e))?;
        let line = serde_json::to_string(incident)
            .map_err(|e| GuardError::serialization("incident", e))?;
        writeln!(file, "{line}").map_err(|e| GuardError::io("writing audit log", e))?;

        seen.insert(incident.incident_id.clone());
        error!(
            message = "incident recorded",
            incident_id = %incident.incident_id,
            kind = incident.kind.as_str(),
            correlation_id = %incident.correlation_id
        );
        Ok(true)
    }

    /// Every incident in the log. A missing file is an empty log.
    pub fn read_all(&self) -> GuardResult<Vec<Incident>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GuardError::io("opening audit log", e)),
        };

        let mut incidents = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| GuardError::io("reading audit log", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let incident: Incident = serde_json::from_str(&line)
                .map_err(|e| GuardError::serialization("parsing audit log line", e))?;
            incidents.push(incident);
        }
        Ok(incidents)
    }
}
