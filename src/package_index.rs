//! Remote lookups: does a distribution exist on the package index, and what
//! is the published hash of this gatekeeper's own release. Both degrade to
//! "cannot verify" on any network or parse failure.

use crate::errors::{GuardError, GuardResult};
use std::time::Duration;
use tracing::{debug, warn};

pub trait PackageIndex: Send + Sync {
    /// Whether the index knows `distribution`. Network failure answers `false`.
    fn distribution_exists(&self, distribution: &str) -> bool;
}

/// Result of looking up a published release hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashLookup {
    Found(String),
    Offline(String),
}

pub trait ReleaseHashSource: Send + Sync {
    fn release_hash(&self, package: &str, version: &str) -> HashLookup;
}

fn client(timeout: Duration) -> GuardResult<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GuardError::network("building http client", e))
}

/// PyPI-compatible JSON API (`{base}/pypi/{name}/json`).
#[derive(Debug, Clone)]
pub struct PyPiIndex {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl PyPiIndex {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> GuardResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            client: client(timeout)?,
        })
    }

    pub fn endpoint(&self, distribution: &str) -> String {
        format!(
            "{}/pypi/{}/json",
            self.base_url.trim_end_matches('/'),
            distribution
        )
    }
}

impl PackageIndex for PyPiIndex {
    fn distribution_exists(&self, distribution: &str) -> bool {
        let url = self.endpoint(distribution);
        match self.client.get(&url).send() {
            Ok(response) => {
                let found = response.status().is_success();
                debug!(message = "package index lookup", distribution = %distribution, status = %response.status(), found);
                found
            }
            Err(e) => {
                warn!(
                    message = "package index unreachable; treating distribution as absent",
                    distribution = %distribution,
                    error = %e
                );
                false
            }
        }
    }
}

/// crates.io-compatible registry API; the release hash is the published
/// `.crate` checksum.
#[derive(Debug, Clone)]
pub struct CratesIoRegistry {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl CratesIoRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> GuardResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            client: client(timeout)?,
        })
    }

    pub fn endpoint(&self, package: &str, version: &str) -> String {
        format!(
            "{}/api/v1/crates/{}/{}",
            self.base_url.trim_end_matches('/'),
            package,
            version
        )
    }

    fn fetch(&self, package: &str, version: &str) -> GuardResult<serde_json::Value> {
        let response = self
            .client
            .get(self.endpoint(package, version))
            .send()
            .map_err(|e| GuardError::network("release metadata request", e))?
            .error_for_status()
            .map_err(|e| GuardError::network("release metadata status", e))?;
        response
            .json::<serde_json::Value>()
            .map_err(|e| GuardError::network("release metadata body", e))
    }
}

/// Pull `version.checksum` out of a registry response.
pub fn checksum_from_metadata(metadata: &serde_json::Value) -> Option<String> {
    metadata
        .get("version")?
        .get("checksum")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
}

impl ReleaseHashSource for CratesIoRegistry {
    fn release_hash(&self, package: &str, version: &str) -> HashLookup {
        match self.fetch(package, version) {
            Ok(metadata) => match checksum_from_metadata(&metadata) {
                Some(hash) => HashLookup::Found(hash),
                None => HashLookup::Offline("release metadata carries no checksum".to_string()),
            },
            Err(e) => HashLookup::Offline(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoints() {
        let index = PyPiIndex::new("https://pypi.org/", Duration::from_secs(2)).unwrap();
        assert_eq!(index.endpoint("requests"), "https://pypi.org/pypi/requests/json");

        let registry = CratesIoRegistry::new("https://crates.io", Duration::from_secs(2)).unwrap();
        assert_eq!(
            registry.endpoint("depgate", "0.4.2"),
            "https://crates.io/api/v1/crates/depgate/0.4.2"
        );
    }

    #[test]
    fn test_checksum_extraction() {
        let metadata = json!({"version": {"num": "0.4.2", "checksum": "ABCDEF"}});
        assert_eq!(checksum_from_metadata(&metadata), Some("abcdef".to_string()));
        assert_eq!(checksum_from_metadata(&json!({"version": {}})), None);
        assert_eq!(checksum_from_metadata(&json!({"errors": []})), None);
    }
}
