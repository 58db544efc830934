//! Host and runtime fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;

const UNKNOWN: &str = "unknown";

/// The subset of the fingerprint carried by every incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFingerprint {
    pub host: String,
    pub user: String,
    pub interpreter_path: String,
    pub interpreter_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFingerprint {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub user: String,
    pub interpreter_path: String,
    pub interpreter_hash: String,
    pub cwd: String,
    pub cpu_count: usize,
    pub package: String,
    pub version: String,
}

impl SystemFingerprint {
    pub fn collect() -> Self {
        let process = ProcessFingerprint::current();
        Self {
            hostname: process.host.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: process.user.clone(),
            interpreter_path: process.interpreter_path.clone(),
            interpreter_hash: process.interpreter_hash.clone(),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| UNKNOWN.to_string()),
            cpu_count: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            package: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

impl ProcessFingerprint {
    /// Computed once; the executable is hashed on first use only.
    pub fn current() -> Self {
        static CURRENT: OnceLock<ProcessFingerprint> = OnceLock::new();
        CURRENT
            .get_or_init(|| {
                let exe = std::env::current_exe().ok();
                Self {
                    host: hostname(),
                    user: username(),
                    interpreter_path: exe
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| UNKNOWN.to_string()),
                    interpreter_hash: exe
                        .as_deref()
                        .and_then(hash_file)
                        .unwrap_or_else(|| UNKNOWN.to_string()),
                }
            })
            .clone()
    }
}

pub fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| UNKNOWN.to_string())
}

pub fn username() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Streaming SHA-256 of a file.
pub fn hash_file(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).ok()?;
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_collect_fills_fields() {
        let fingerprint = SystemFingerprint::collect();
        assert_eq!(fingerprint.package, "depgate");
        assert!(!fingerprint.os.is_empty());
        assert!(fingerprint.cpu_count >= 1);
        assert_eq!(fingerprint.interpreter_hash.len(), 64);
        assert_eq!(fingerprint.digest(), fingerprint.clone().digest());
    }

    #[test]
    fn test_hash_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            hash_file(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(hash_file(Path::new("/nonexistent/depgate")).is_none());
    }
}
