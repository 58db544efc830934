use crate::boot::SealingOrchestrator;
use crate::config_loader::{load_config, GuardConfig};
use crate::errors::{GuardError, GuardResult};
use crate::fingerprint::SystemFingerprint;
use crate::incident::IncidentLog;
use crate::patrol::Escalation;
use crate::runtime_identity::{IntegrityStatus, RuntimeIdentity};
use crate::self_hash::hash_source_tree;
use crate::sigverify::{signing_key_from_hex, SignatureStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level CLI interface for depgate
#[derive(Parser)]
#[command(
    name = "depgate",
    version,
    about = "Runtime dependency gatekeeper"
)]
pub struct Cli {
    /// Configuration file (falls back to DEPGATE_CONFIG, then ./depgate.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Seal, install the hooks, start the patrol and print the banner
    Boot {
        /// Print the boot report as JSON
        #[arg(long)]
        json: bool,
        /// Keep the process (and its patrol) alive for this many seconds
        #[arg(long)]
        hold_secs: Option<u64>,
    },

    /// Boot, then run one integrity check against the sealed identity
    Check,

    /// Boot, then import a module through the interceptor
    Import {
        name: String,
        /// Package used to resolve a relative (leading dot) name
        #[arg(long)]
        package: Option<String>,
    },

    /// Print the SHA-256 of a source tree
    HashTree { dir: PathBuf },

    /// Print the system fingerprint as JSON
    Fingerprint,

    /// Print the recorded incidents, one JSON object per line
    Incidents,

    /// Sign every guarded object and write the signature store
    SignStore {
        /// File holding the 32-byte hex signing seed
        #[arg(short, long)]
        key: PathBuf,
        /// Output path (defaults to the configured signature store)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the resolved configuration as TOML
    Config,
}

fn boot(config: GuardConfig) -> GuardResult<crate::boot::BootOutcome> {
    SealingOrchestrator::new(config)
        .escalation(Escalation::ExitProcess)
        .run()
}

fn to_json<T: serde::Serialize>(value: &T, context: &str) -> GuardResult<String> {
    serde_json::to_string_pretty(value).map_err(|e| GuardError::serialization(context, e))
}

pub fn dispatch(cli: Cli) -> GuardResult<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Boot { json, hold_secs } => {
            let outcome = boot(config)?;
            if json {
                println!("{}", to_json(&outcome.report, "boot report")?);
            }
            if let Some(secs) = hold_secs {
                std::thread::sleep(Duration::from_secs(secs));
            }
        }
        Commands::Check => {
            let outcome = boot(config)?;
            match outcome.identity.check_integrity()? {
                IntegrityStatus::Clean { elapsed } => {
                    println!("clean ({} us)", elapsed.as_micros());
                }
                IntegrityStatus::Mismatch(comparison) => {
                    println!("mismatch: {}", comparison.mismatched_labels().join(", "));
                }
            }
        }
        Commands::Import { name, package } => {
            let outcome = boot(config)?;
            let module = if name.starts_with('.') || package.is_some() {
                outcome.identity.import_module(&name, package.as_deref())?
            } else {
                outcome.identity.import(&name)?
            };
            println!("{}", to_json(&module, "module")?);
        }
        Commands::HashTree { dir } => {
            println!("{}", hash_source_tree(&dir)?);
        }
        Commands::Fingerprint => {
            println!("{}", to_json(&SystemFingerprint::collect(), "fingerprint")?);
        }
        Commands::Incidents => {
            for incident in IncidentLog::new(config.audit_log.clone()).read_all()? {
                let line = serde_json::to_string(&incident)
                    .map_err(|e| GuardError::serialization("incident", e))?;
                println!("{line}");
            }
        }
        Commands::SignStore { key, out } => {
            let seed = std::fs::read_to_string(&key)
                .map_err(|e| GuardError::io(format!("reading key {}", key.display()), e))?;
            let signing_key = signing_key_from_hex(&seed)?;
            let out = out.unwrap_or_else(|| config.signature_store.clone());
            let identity = RuntimeIdentity::builder(config).build()?;
            let store = SignatureStore::sign(identity.namespace(), &signing_key)?;
            store.save(&out)?;
            println!("signed {} objects into {}", store.entries.len(), out.display());
        }
        Commands::Config => {
            let text = toml::to_string(&config)
                .map_err(|e| GuardError::config(format!("rendering configuration: {e}")))?;
            print!("{text}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["depgate", "import", "requests"]).unwrap();
        assert!(matches!(cli.command, Commands::Import { ref name, package: None } if name == "requests"));

        let cli = Cli::try_parse_from(["depgate", "--config", "x.toml", "boot", "--json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Commands::Boot { json: true, hold_secs: None }));

        assert!(Cli::try_parse_from(["depgate", "sign-store"]).is_err());
    }
}
