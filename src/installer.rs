//! Package-manager subprocess and the catalog of installed distributions.

use crate::errors::{GuardError, GuardResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub trait PackageInstaller: Send + Sync {
    /// Install `requirement` (`dist` or `dist==version`), blocking until the
    /// package manager exits.
    fn install(&self, requirement: &str) -> GuardResult<()>;
}

/// Installs with `python -m pip install`.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    python: PathBuf,
    verbose: bool,
}

impl PipInstaller {
    pub fn new(python: impl Into<PathBuf>, verbose: bool) -> Self {
        Self {
            python: python.into(),
            verbose,
        }
    }

    fn command(&self, requirement: &str) -> Command {
        let mut command = Command::new(&self.python);
        command.args([
            "-m",
            "pip",
            "install",
            requirement,
            "--progress-bar",
            "off",
            "--disable-pip-version-check",
        ]);
        if !self.verbose {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        command
    }
}

impl PackageInstaller for PipInstaller {
    fn install(&self, requirement: &str) -> GuardResult<()> {
        info!(message = "installing missing distribution", requirement = %requirement);
        let status = self
            .command(requirement)
            .status()
            .map_err(|e| GuardError::install(requirement, format!("failed to spawn package manager: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(GuardError::install(requirement, format!("package manager exited with {status}")))
        }
    }
}

pub trait DistributionCatalog: Send + Sync {
    /// Case-insensitive membership test.
    fn is_installed(&self, distribution: &str) -> bool;
}

/// Reads `*.dist-info` and `*.egg-info` metadata under each root.
#[derive(Debug, Clone, Default)]
pub struct SitePackagesCatalog {
    roots: Vec<PathBuf>,
}

impl SitePackagesCatalog {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn installed(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for root in &self.roots {
            let entries = WalkDir::new(root)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(Result::ok);
            for entry in entries {
                let file_name = entry.file_name().to_string_lossy();
                let metadata_file = if file_name.ends_with(".dist-info") {
                    "METADATA"
                } else if file_name.ends_with(".egg-info") {
                    "PKG-INFO"
                } else {
                    continue;
                };
                let name = read_metadata_name(&entry.path().join(metadata_file))
                    .or_else(|| file_name.split('-').next().map(str::to_string));
                if let Some(name) = name {
                    names.insert(normalize_distribution(&name));
                }
            }
        }
        names
    }
}

impl DistributionCatalog for SitePackagesCatalog {
    fn is_installed(&self, distribution: &str) -> bool {
        self.installed().contains(&normalize_distribution(distribution))
    }
}

fn read_metadata_name(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .take_while(|line| !line.is_empty())
        .find_map(|line| line.strip_prefix("Name:"))
        .map(|name| name.trim().to_string())
}

/// Lowercase, with `_` and `.` folded to `-`.
pub fn normalize_distribution(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

const SITE_SCRIPT: &str = "import json, site\n\
paths = list(site.getsitepackages())\n\
user = site.getusersitepackages()\n\
paths.append(user) if isinstance(user, str) else None\n\
print(json.dumps(paths))";

/// Ask the interpreter where its site-packages live. Empty when the
/// interpreter cannot be run.
pub fn discover_site_packages(python: &Path) -> Vec<PathBuf> {
    let output = match Command::new(python)
        .args(["-c", SITE_SCRIPT])
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!(message = "site-packages discovery failed", python = %python.display(), status = %output.status);
            return Vec::new();
        }
        Err(e) => {
            warn!(message = "interpreter not runnable", python = %python.display(), error = %e);
            return Vec::new();
        }
    };

    match serde_json::from_slice::<Vec<PathBuf>>(&output.stdout) {
        Ok(paths) => {
            let roots: Vec<PathBuf> = paths.into_iter().filter(|p| p.is_dir()).collect();
            debug!(message = "discovered site-packages", count = roots.len());
            roots
        }
        Err(e) => {
            warn!(message = "unreadable site-packages listing", error = %e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_catalog_reads_metadata() {
        let temp = TempDir::new().unwrap();
        let dist = temp.path().join("requests-2.31.0.dist-info");
        fs::create_dir_all(&dist).unwrap();
        fs::write(dist.join("METADATA"), "Metadata-Version: 2.1\nName: Requests\nVersion: 2.31.0\n").unwrap();

        let egg = temp.path().join("Typing_Extensions-4.0.egg-info");
        fs::create_dir_all(&egg).unwrap();

        let catalog = SitePackagesCatalog::new(vec![temp.path().to_path_buf()]);
        assert!(catalog.is_installed("requests"));
        assert!(catalog.is_installed("REQUESTS"));
        assert!(catalog.is_installed("typing-extensions"));
        assert!(!catalog.is_installed("numpy"));
    }

    #[test]
    fn test_catalog_missing_root() {
        let catalog = SitePackagesCatalog::new(vec![PathBuf::from("/nonexistent/depgate-site")]);
        assert!(catalog.installed().is_empty());
    }

    #[test]
    fn test_normalize_distribution() {
        assert_eq!(normalize_distribution("Typing_Extensions"), "typing-extensions");
        assert_eq!(normalize_distribution("zope.interface"), "zope-interface");
    }

    #[test]
    fn test_unrunnable_package_manager_is_install_error() {
        let installer = PipInstaller::new("/nonexistent/python-for-depgate", false);
        let err = installer.install("requests").unwrap_err();
        assert!(matches!(err, GuardError::Install { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_discovery_without_interpreter() {
        assert!(discover_site_packages(Path::new("/nonexistent/python-for-depgate")).is_empty());
    }
}
