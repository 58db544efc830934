// Allow, deny and alias lists plus the name filters applied before any
// install attempt.

use crate::config_loader::GuardConfig;
use crate::errors::{GuardError, GuardResult};
use crate::resolver::is_builtin_module;
use std::collections::{BTreeMap, BTreeSet};

/// Module names whose distribution is published under a different name.
pub const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("PIL", "Pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
    ("bs4", "beautifulsoup4"),
    ("Crypto", "pycryptodome"),
    ("skimage", "scikit-image"),
    ("Image", "Pillow"),
    ("lxml.etree", "lxml"),
];

/// Names that show up in failed imports but are never real distributions.
pub const SKIP_LIST: &[&str] = &[
    "cwd",
    "_subprocess",
    "_elementtree",
    "grp",
    "pwd",
    "compression",
    "tests",
];

/// Version words that mean "install whatever is current".
pub const UNPINNED_VERSIONS: &[&str] = &[
    "latest",
    "any",
    "none",
    "null",
    "undefined",
    "unspecified",
    "unknown",
    "unversioned",
    "*",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Proceed,
    SubmoduleWithoutAlias,
    Denied,
    Builtin,
    Private,
    InvalidName,
    NotAllowed,
}

impl FilterVerdict {
    pub fn reason(&self) -> &'static str {
        match self {
            FilterVerdict::Proceed => "eligible",
            FilterVerdict::SubmoduleWithoutAlias => "submodule without alias",
            FilterVerdict::Denied => "deny-listed",
            FilterVerdict::Builtin => "builtin module",
            FilterVerdict::Private => "private name",
            FilterVerdict::InvalidName => "not a valid identifier",
            FilterVerdict::NotAllowed => "not in allow-list",
        }
    }
}

/// Immutable after construction; shared read-only across threads.
#[derive(Debug, Clone, Default)]
pub struct AllowDenyAliasLists {
    allow: BTreeSet<String>,
    deny: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
}

impl AllowDenyAliasLists {
    pub fn new(
        allow: impl IntoIterator<Item = String>,
        deny: impl IntoIterator<Item = String>,
        aliases: BTreeMap<String, String>,
    ) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            deny: deny.into_iter().collect(),
            aliases,
        }
    }

    /// Built-in aliases and skip list, overlaid with the configured entries.
    pub fn from_config(config: &GuardConfig) -> Self {
        let mut aliases: BTreeMap<String, String> = BUILTIN_ALIASES
            .iter()
            .map(|(module, dist)| (module.to_string(), dist.to_string()))
            .collect();
        aliases.extend(config.aliases.clone());

        let deny = SKIP_LIST
            .iter()
            .map(|s| s.to_string())
            .chain(config.deny.iter().cloned());

        Self::new(config.allow.iter().cloned(), deny, aliases)
    }

    pub fn alias_for(&self, name: &str) -> Option<&str> {
        self.aliases.get(name).map(String::as_str)
    }

    /// Distribution to install for `name`: an alias of the full name, an alias
    /// of its top-level package, or the top-level package itself.
    pub fn distribution_for(&self, name: &str) -> String {
        let top = top_level(name);
        self.alias_for(name)
            .or_else(|| self.alias_for(top))
            .unwrap_or(top)
            .to_string()
    }

    pub fn evaluate(&self, name: &str) -> FilterVerdict {
        let top = top_level(name);

        if name.contains('.') && self.alias_for(name).is_none() && self.alias_for(top).is_none() {
            return FilterVerdict::SubmoduleWithoutAlias;
        }
        if self.deny.contains(top) {
            return FilterVerdict::Denied;
        }
        if is_builtin_module(top) {
            return FilterVerdict::Builtin;
        }
        if top.starts_with('_') {
            return FilterVerdict::Private;
        }
        if !is_identifier(top) {
            return FilterVerdict::InvalidName;
        }
        if !self.allow.is_empty() && !self.allow.contains(top) && !self.allow.contains(name) {
            return FilterVerdict::NotAllowed;
        }
        FilterVerdict::Proceed
    }
}

pub fn top_level(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

pub fn is_identifier(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {
            chars.all(|c| c == '_' || c.is_alphanumeric())
        }
        _ => false,
    }
}

/// Literal-only module name accepted by the JIT entry point: a plain dotted
/// identifier path. Anything else is a policy violation.
pub fn validate_literal_name(name: &str) -> GuardResult<()> {
    if name.is_empty() || !name.split('.').all(is_identifier) {
        return Err(GuardError::policy(format!(
            "dynamic import of non-literal module name '{}' rejected",
            name.escape_default()
        )));
    }
    Ok(())
}

/// `None` when the version is one of the unpinned words; otherwise the
/// validated version text.
pub fn normalize_version(version: &str) -> GuardResult<Option<&str>> {
    let trimmed = version.trim();
    if trimmed.is_empty() || UNPINNED_VERSIONS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        return Ok(None);
    }
    let valid = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '!' | '*'));
    if !valid {
        return Err(GuardError::policy(format!(
            "version literal '{}' rejected",
            trimmed.escape_default()
        )));
    }
    Ok(Some(trimmed))
}

/// `dist` or `dist==version`.
pub fn requirement(distribution: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("{distribution}=={version}"),
        None => distribution.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists() -> AllowDenyAliasLists {
        AllowDenyAliasLists::from_config(&GuardConfig {
            deny: vec!["evilpkg".into()],
            ..GuardConfig::default()
        })
    }

    #[test]
    fn test_filter_cases() {
        let lists = lists();
        assert_eq!(lists.evaluate("os"), FilterVerdict::Builtin);
        assert_eq!(lists.evaluate("_private"), FilterVerdict::Private);
        assert_eq!(lists.evaluate("not a valid name!"), FilterVerdict::InvalidName);
        assert_eq!(lists.evaluate("some.sub.module"), FilterVerdict::SubmoduleWithoutAlias);
        assert_eq!(lists.evaluate("evilpkg"), FilterVerdict::Denied);
        assert_eq!(lists.evaluate("pwd"), FilterVerdict::Denied);
        assert_eq!(lists.evaluate("requests"), FilterVerdict::Proceed);
    }

    #[test]
    fn test_aliased_submodule_proceeds() {
        let lists = lists();
        assert_eq!(lists.evaluate("lxml.etree"), FilterVerdict::Proceed);
        assert_eq!(lists.distribution_for("lxml.etree"), "lxml");
        assert_eq!(lists.evaluate("PIL.Image"), FilterVerdict::Proceed);
        assert_eq!(lists.distribution_for("PIL.Image"), "Pillow");
        assert_eq!(lists.distribution_for("requests"), "requests");
    }

    #[test]
    fn test_allow_list_restricts() {
        let lists = AllowDenyAliasLists::new(
            vec!["requests".to_string()],
            Vec::new(),
            BTreeMap::new(),
        );
        assert_eq!(lists.evaluate("requests"), FilterVerdict::Proceed);
        assert_eq!(lists.evaluate("numpy"), FilterVerdict::NotAllowed);
    }

    #[test]
    fn test_configured_alias_overrides_builtin() {
        let lists = AllowDenyAliasLists::from_config(&GuardConfig {
            aliases: [("yaml".to_string(), "ruamel.yaml".to_string())].into_iter().collect(),
            ..GuardConfig::default()
        });
        assert_eq!(lists.distribution_for("yaml"), "ruamel.yaml");
        assert_eq!(lists.distribution_for("cv2"), "opencv-python");
    }

    #[test]
    fn test_literal_names() {
        assert!(validate_literal_name("requests").is_ok());
        assert!(validate_literal_name("a.b_c.d2").is_ok());
        let err = validate_literal_name("os; rm -rf").unwrap_err();
        assert!(matches!(err, GuardError::PolicyViolation { .. }));
        assert!(validate_literal_name("").is_err());
        assert!(validate_literal_name("a..b").is_err());
    }

    #[test]
    fn test_versions() {
        assert_eq!(normalize_version("latest").unwrap(), None);
        assert_eq!(normalize_version("ANY").unwrap(), None);
        assert_eq!(normalize_version("").unwrap(), None);
        assert_eq!(normalize_version("2.31.0").unwrap(), Some("2.31.0"));
        assert!(normalize_version("1.0; echo").is_err());
        assert_eq!(requirement("requests", Some("2.31.0")), "requests==2.31.0");
        assert_eq!(requirement("requests", None), "requests");
    }
}
