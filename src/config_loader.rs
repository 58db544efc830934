//! Layered configuration: serialized defaults, then `depgate.toml`, then
//! `DEPGATE_*` environment variables.

use crate::errors::{GuardError, GuardResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "DEPGATE_";
pub const DEFAULT_CONFIG_FILE: &str = "depgate.toml";

/// Resolved configuration for one process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    #[serde(deserialize_with = "de_flag")]
    pub hardened: bool,
    #[serde(deserialize_with = "de_flag")]
    pub disable_integrity_check: bool,
    #[serde(deserialize_with = "de_flag")]
    pub child: bool,
    #[serde(deserialize_with = "de_flag")]
    pub standalone: bool,
    #[serde(deserialize_with = "de_flag")]
    pub light: bool,
    #[serde(deserialize_with = "de_flag")]
    pub debug: bool,
    #[serde(deserialize_with = "de_opt_text")]
    pub parent_id: Option<String>,
    #[serde(deserialize_with = "de_flag")]
    pub no_capture: bool,
    #[serde(deserialize_with = "de_flags")]
    pub flags: BTreeMap<String, serde_json::Value>,

    #[serde(deserialize_with = "de_opt_text")]
    pub trusted_hash: Option<String>,
    #[serde(deserialize_with = "de_flag")]
    pub require_signatures: bool,
    #[serde(deserialize_with = "de_opt_text")]
    pub signature_public_key: Option<String>,
    pub signature_store: PathBuf,
    pub source_root: Option<PathBuf>,
    pub registry_url: String,

    #[serde(deserialize_with = "de_flag")]
    pub verbose_install: bool,
    #[serde(deserialize_with = "de_flag")]
    pub verify_index: bool,
    #[serde(deserialize_with = "de_name_list")]
    pub allow: Vec<String>,
    #[serde(deserialize_with = "de_name_list")]
    pub deny: Vec<String>,
    #[serde(deserialize_with = "de_alias_map")]
    pub aliases: BTreeMap<String, String>,
    pub python: PathBuf,
    #[serde(deserialize_with = "de_path_list")]
    pub site_packages: Vec<PathBuf>,
    pub index_url: String,
    pub network_timeout_ms: u64,

    pub audit_log: PathBuf,

    pub patrol_threads: usize,
    pub patrol_min_secs: f64,
    pub patrol_max_secs: f64,
    pub entropy_samples: usize,

    pub allowed_namespace: String,
    pub log_level: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("depgate");

        Self {
            hardened: false,
            disable_integrity_check: false,
            child: false,
            standalone: false,
            light: false,
            debug: false,
            parent_id: None,
            no_capture: false,
            flags: BTreeMap::new(),
            trusted_hash: None,
            require_signatures: false,
            signature_public_key: None,
            signature_store: data_dir.join("signatures.json"),
            source_root: None,
            registry_url: "https://crates.io".to_string(),
            verbose_install: false,
            verify_index: true,
            allow: Vec::new(),
            deny: Vec::new(),
            aliases: BTreeMap::new(),
            python: PathBuf::from("python3"),
            site_packages: Vec::new(),
            index_url: "https://pypi.org".to_string(),
            network_timeout_ms: 2_000,
            audit_log: data_dir.join("incidents.jsonl"),
            patrol_threads: 4,
            patrol_min_secs: 10.0,
            patrol_max_secs: 30.0,
            entropy_samples: 10,
            allowed_namespace: "standalone".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GuardConfig {
    /// Tree hashed by the self-hash validation: the configured root, or the
    /// crate's own `src/` directory as it was at build time.
    pub fn source_root(&self) -> PathBuf {
        self.source_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/src")))
    }

    pub fn network_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.network_timeout_ms)
    }

    pub fn validate(&self) -> GuardResult<()> {
        if self.patrol_threads == 0 {
            return Err(GuardError::config("patrol_threads must be at least 1"));
        }
        if !(self.patrol_min_secs > 0.0 && self.patrol_min_secs <= self.patrol_max_secs) {
            return Err(GuardError::config(format!(
                "patrol window [{}, {}] is not a valid interval",
                self.patrol_min_secs, self.patrol_max_secs
            )));
        }
        if self.entropy_samples < 2 {
            return Err(GuardError::config("entropy_samples must be at least 2"));
        }
        if self.network_timeout_ms == 0 {
            return Err(GuardError::config("network_timeout_ms must be positive"));
        }
        if self.allowed_namespace.trim().is_empty() {
            return Err(GuardError::config("allowed_namespace cannot be empty"));
        }
        Ok(())
    }
}

/// Load configuration. `path` wins over `DEPGATE_CONFIG`, which wins over
/// `./depgate.toml`; a missing file contributes nothing.
pub fn load_config(path: Option<&Path>) -> GuardResult<GuardConfig> {
    let file = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("DEPGATE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let figment = Figment::from(Serialized::defaults(GuardConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["config", "log"]));

    let config: GuardConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match RawScalar::deserialize(deserializer)? {
        RawScalar::Bool(value) => Ok(value),
        RawScalar::Int(value) => Ok(value != 0),
        RawScalar::UInt(value) => Ok(value != 0),
        RawScalar::Float(value) => Ok(value != 0.0),
        RawScalar::Text(text) => {
            parse_flag(&text).ok_or_else(|| D::Error::custom(format!("invalid flag value '{text}'")))
        }
    }
}

fn de_opt_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<RawScalar>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| {
        let text = match value {
            RawScalar::Bool(v) => v.to_string(),
            RawScalar::Int(v) => v.to_string(),
            RawScalar::UInt(v) => v.to_string(),
            RawScalar::Float(v) => v.to_string(),
            RawScalar::Text(v) => v,
        };
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrText<T> {
    List(Vec<T>),
    Text(String),
}

fn de_name_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match ListOrText::<String>::deserialize(deserializer)? {
        ListOrText::List(items) => items,
        ListOrText::Text(text) => text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

fn de_path_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<PathBuf>, D::Error> {
    Ok(match ListOrText::<PathBuf>::deserialize(deserializer)? {
        ListOrText::List(items) => items,
        ListOrText::Text(text) => std::env::split_paths(&text)
            .filter(|p| !p.as_os_str().is_empty())
            .collect(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MapOrText<V> {
    Map(BTreeMap<String, V>),
    Text(String),
}

fn de_alias_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    match MapOrText::<String>::deserialize(deserializer)? {
        MapOrText::Map(map) => Ok(map),
        MapOrText::Text(text) => parse_alias_pairs(&text).map_err(D::Error::custom),
    }
}

/// Parse `module=distribution` pairs separated by commas.
pub fn parse_alias_pairs(text: &str) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for pair in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (module, dist) = pair
            .split_once('=')
            .ok_or_else(|| format!("alias '{pair}' is not of the form module=distribution"))?;
        let (module, dist) = (module.trim(), dist.trim());
        if module.is_empty() || dist.is_empty() {
            return Err(format!("alias '{pair}' has an empty side"));
        }
        map.insert(module.to_string(), dist.to_string());
    }
    Ok(map)
}

fn de_flags<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, serde_json::Value>, D::Error> {
    match MapOrText::<serde_json::Value>::deserialize(deserializer)? {
        MapOrText::Map(map) => Ok(map),
        MapOrText::Text(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
        MapOrText::Text(text) => serde_json::from_str(&text)
            .map_err(|e| D::Error::custom(format!("flags must be a JSON object: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.verify_index);
        assert!(!config.hardened);
        assert_eq!(config.network_timeout_ms, 2_000);
        assert!(config.source_root().ends_with("src"));
    }

    #[test]
    fn test_file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "depgate.toml",
                r#"
                    hardened = false
                    allow = ["requests", "numpy"]
                    patrol_threads = 2

                    [aliases]
                    PIL = "Pillow"
                "#,
            )?;
            jail.set_env("DEPGATE_HARDENED", "1");
            jail.set_env("DEPGATE_DENY", "evilpkg, worsepkg");
            jail.set_env("DEPGATE_PARENT_ID", "parent-42");

            let config = load_config(None).map_err(|e| e.to_string())?;
            assert!(config.hardened);
            assert_eq!(config.allow, vec!["requests", "numpy"]);
            assert_eq!(config.deny, vec!["evilpkg", "worsepkg"]);
            assert_eq!(config.patrol_threads, 2);
            assert_eq!(config.aliases.get("PIL").map(String::as_str), Some("Pillow"));
            assert_eq!(config.parent_id.as_deref(), Some("parent-42"));
            Ok(())
        });
    }

    #[test]
    fn test_env_aliases_and_flags_text() {
        Jail::expect_with(|jail| {
            jail.set_env("DEPGATE_ALIASES", "cv2=opencv-python,yaml=pyyaml");
            jail.set_env("DEPGATE_FLAGS", r#"{"scan": true}"#);
            jail.set_env("DEPGATE_NO_CAPTURE", "yes");

            let config = load_config(None).map_err(|e| e.to_string())?;
            assert_eq!(config.aliases.len(), 2);
            assert_eq!(config.aliases["cv2"], "opencv-python");
            assert_eq!(config.flags.get("scan"), Some(&serde_json::Value::Bool(true)));
            assert!(config.no_capture);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_patrol_window_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("DEPGATE_PATROL_MIN_SECS", "40");
            jail.set_env("DEPGATE_PATROL_MAX_SECS", "5");
            assert!(load_config(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_parse_flag_words() {
        assert_eq!(parse_flag("on"), Some(true));
        assert_eq!(parse_flag("No"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_parse_alias_pairs_rejects_garbage() {
        assert!(parse_alias_pairs("cv2").is_err());
        assert!(parse_alias_pairs("=x").is_err());
        assert_eq!(parse_alias_pairs("").map(|m| m.len()), Ok(0));
    }
}
