//! Prioritized resolver chain.
//!
//! Module resolution walks the chain front to back and the first resolver that
//! recognizes a name wins. The auto-install finder is inserted at the front
//! when hooks are installed.

use crate::errors::{GuardError, GuardResult, SafeReadLock, SafeWriteLock};
use crate::namespace::Guarded;
use crate::runtime_identity::RuntimeIdentity;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const SOURCE: &str = include_str!("resolver.rs");

/// Names provided by the interpreter itself; never installed from an index.
pub const BUILTIN_MODULES: &[&str] = &[
    "__future__", "_thread", "abc", "argparse", "array", "ast", "asyncio", "atexit",
    "base64", "binascii", "bisect", "builtins", "bz2", "calendar", "cmath", "codecs",
    "collections", "concurrent", "configparser", "contextlib", "copy", "csv", "ctypes",
    "dataclasses", "datetime", "decimal", "difflib", "dis", "email", "enum", "errno",
    "faulthandler", "fcntl", "filecmp", "fnmatch", "fractions", "functools", "gc",
    "getopt", "getpass", "gettext", "glob", "gzip", "hashlib", "heapq", "hmac", "html",
    "http", "importlib", "inspect", "io", "ipaddress", "itertools", "json", "keyword",
    "linecache", "locale", "logging", "lzma", "marshal", "math", "mimetypes",
    "multiprocessing", "numbers", "operator", "os", "pathlib", "pickle", "pkgutil",
    "platform", "posix", "pprint", "queue", "random", "re", "reprlib", "resource",
    "secrets", "select", "selectors", "shlex", "shutil", "signal", "site", "socket",
    "sqlite3", "ssl", "stat", "statistics", "string", "struct", "subprocess", "sys",
    "sysconfig", "tarfile", "tempfile", "textwrap", "threading", "time", "timeit",
    "token", "tokenize", "traceback", "types", "typing", "unicodedata", "unittest",
    "urllib", "uuid", "venv", "warnings", "weakref", "xml", "zipfile", "zipimport", "zlib",
];

pub fn is_builtin_module(top_level: &str) -> bool {
    BUILTIN_MODULES.contains(&top_level)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleOrigin {
    Builtin,
    File(PathBuf),
}

/// A resolved module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Module {
    pub name: String,
    pub origin: ModuleOrigin,
}

impl Module {
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: ModuleOrigin::Builtin,
        }
    }

    pub fn at(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            origin: ModuleOrigin::File(path.into()),
        }
    }
}

/// One link of the resolver chain.
pub trait Resolver: Guarded {
    /// `Ok(None)` means "not mine, ask the next resolver".
    fn find(&self, name: &str, identity: &RuntimeIdentity) -> GuardResult<Option<Module>>;

    /// Resolvers that install packages are skipped by passive resolution.
    fn auto_installs(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct ResolverChain {
    entries: RwLock<Vec<Arc<dyn Resolver>>>,
}

impl fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self
            .entries
            .read()
            .map(|entries| entries.iter().map(|r| r.qualified_name()).collect())
            .unwrap_or_default();
        f.debug_struct("ResolverChain").field("entries", &names).finish()
    }
}

fn address(resolver: &Arc<dyn Resolver>) -> usize {
    Arc::as_ptr(resolver) as *const () as usize
}

impl ResolverChain {
    pub fn new(entries: Vec<Arc<dyn Resolver>>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Walk the chain. The entry list is snapshotted first so resolvers may
    /// detach or reattach themselves while running.
    pub fn resolve(&self, name: &str, identity: &RuntimeIdentity) -> GuardResult<Module> {
        let entries = self.entries.safe_read()?.clone();
        for resolver in entries {
            if let Some(module) = resolver.find(name, identity)? {
                return Ok(module);
            }
        }
        Err(GuardError::module_not_found(name))
    }

    /// Like [`resolve`](Self::resolve) but never consults auto-installing
    /// resolvers.
    pub fn resolve_passive(&self, name: &str, identity: &RuntimeIdentity) -> GuardResult<Module> {
        let entries = self.entries.safe_read()?.clone();
        for resolver in entries.iter().filter(|r| !r.auto_installs()) {
            if let Some(module) = resolver.find(name, identity)? {
                return Ok(module);
            }
        }
        Err(GuardError::module_not_found(name))
    }

    pub fn insert_front(&self, resolver: Arc<dyn Resolver>) -> GuardResult<()> {
        self.entries.safe_write()?.insert(0, resolver);
        Ok(())
    }

    pub fn push(&self, resolver: Arc<dyn Resolver>) -> GuardResult<()> {
        self.entries.safe_write()?.push(resolver);
        Ok(())
    }

    /// Remove the first entry that is the object at `target` and hand it back.
    pub fn take(&self, target: usize) -> GuardResult<Option<Arc<dyn Resolver>>> {
        let mut entries = self.entries.safe_write()?;
        Ok(entries
            .iter()
            .position(|entry| address(entry) == target)
            .map(|idx| entries.remove(idx)))
    }

    pub fn contains(&self, target: usize) -> GuardResult<bool> {
        Ok(self
            .entries
            .safe_read()?
            .iter()
            .any(|entry| address(entry) == target))
    }

    pub fn len(&self) -> GuardResult<usize> {
        Ok(self.entries.safe_read()?.len())
    }

    pub fn is_empty(&self) -> GuardResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Resolves interpreter-provided module names.
#[derive(Debug, Default)]
pub struct BuiltinResolver;

impl Guarded for BuiltinResolver {
    fn source(&self) -> &'static str {
        SOURCE
    }
}

impl Resolver for BuiltinResolver {
    fn find(&self, name: &str, _identity: &RuntimeIdentity) -> GuardResult<Option<Module>> {
        let top = name.split('.').next().unwrap_or(name);
        Ok(is_builtin_module(top).then(|| Module::builtin(name)))
    }
}

/// Resolves names against package directories on disk.
#[derive(Debug, Clone, Default)]
pub struct SitePackagesResolver {
    roots: Vec<PathBuf>,
}

impl SitePackagesResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// `pkg/__init__.py`, `pkg.py` or a compiled extension `pkg.*.so|pyd`.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        let parts: Vec<&str> = name.split('.').collect();
        let (leaf, parents) = parts.split_last()?;
        if leaf.is_empty() || parents.iter().any(|p| p.is_empty()) {
            return None;
        }

        self.roots.iter().find_map(|root| {
            let dir = parents.iter().fold(root.clone(), |acc, part| acc.join(part));
            let package = dir.join(leaf).join("__init__.py");
            if package.is_file() {
                return Some(package);
            }
            let module = dir.join(format!("{leaf}.py"));
            if module.is_file() {
                return Some(module);
            }
            find_extension(&dir, leaf)
        })
    }
}

fn find_extension(dir: &Path, leaf: &str) -> Option<PathBuf> {
    let prefix = format!("{leaf}.");
    std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let is_extension = file_name.ends_with(".so") || file_name.ends_with(".pyd");
        (is_extension && file_name.starts_with(&prefix)).then(|| entry.path())
    })
}

impl Guarded for SitePackagesResolver {
    fn source(&self) -> &'static str {
        SOURCE
    }
}

impl Resolver for SitePackagesResolver {
    fn find(&self, name: &str, _identity: &RuntimeIdentity) -> GuardResult<Option<Module>> {
        Ok(self.locate(name).map(|path| Module::at(name, path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_names() {
        assert!(is_builtin_module("os"));
        assert!(is_builtin_module("json"));
        assert!(!is_builtin_module("requests"));
    }

    #[test]
    fn test_site_packages_locate() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("pkg/sub")).unwrap();
        fs::write(root.join("pkg/__init__.py"), "").unwrap();
        fs::write(root.join("pkg/sub/leaf.py"), "").unwrap();
        fs::write(root.join("single.py"), "").unwrap();
        fs::write(root.join("fast.cpython-312-x86_64-linux-gnu.so"), "").unwrap();

        let resolver = SitePackagesResolver::new(vec![root.to_path_buf()]);
        assert_eq!(resolver.locate("pkg"), Some(root.join("pkg/__init__.py")));
        assert_eq!(resolver.locate("pkg.sub.leaf"), Some(root.join("pkg/sub/leaf.py")));
        assert_eq!(resolver.locate("single"), Some(root.join("single.py")));
        assert!(resolver.locate("fast").is_some());
        assert!(resolver.locate("absent").is_none());
        assert!(resolver.locate("pkg..x").is_none());
    }

    #[test]
    fn test_chain_insert_and_remove() {
        let chain = ResolverChain::new(vec![Arc::new(BuiltinResolver)]);
        let extra: Arc<dyn Resolver> = Arc::new(SitePackagesResolver::default());
        let target = address(&extra);

        chain.insert_front(extra).unwrap();
        assert_eq!(chain.len().unwrap(), 2);
        assert!(chain.contains(target).unwrap());

        assert!(chain.take(target).unwrap().is_some());
        assert!(chain.take(target).unwrap().is_none());
        assert_eq!(chain.len().unwrap(), 1);
    }
}
