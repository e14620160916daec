use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

const DEFAULT_DB: &str = "./view_ledger.sqlite3";
const DEFAULT_BIND: &str = "127.0.0.1:4020";

#[derive(Debug, Default, Parser)]
#[command(name = "view-ledger-service")]
#[command(about = "Local HTTP service for View Ledger")]
pub struct Args {
    /// YAML file with `db`, `bind` and `categories_url` keys.
    #[arg(long, env = "VIEW_LEDGER_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "VIEW_LEDGER_DB")]
    pub db: Option<PathBuf>,
    #[arg(long, env = "VIEW_LEDGER_BIND")]
    pub bind: Option<SocketAddr>,
    /// Base URL of the category service. Categories are not checked when unset.
    #[arg(long, env = "VIEW_LEDGER_CATEGORIES_URL")]
    pub categories_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub db: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub categories_url: Option<String>,
}

impl FileConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub db: PathBuf,
    pub bind: SocketAddr,
    pub categories_url: Option<String>,
}

impl ServiceConfig {
    /// Flags and environment win over the config file, which wins over defaults.
    ///
    /// # Errors
    /// Returns an error when the config file is unreadable or a default fails to parse.
    pub fn from_args(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let bind = match args.bind.or(file.bind) {
            Some(bind) => bind,
            None => DEFAULT_BIND.parse().context("invalid default bind address")?,
        };
        Ok(Self {
            db: args.db.or(file.db).unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
            bind,
            categories_url: args
                .categories_url
                .or(file.categories_url)
                .filter(|url| !url.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags_or_file() -> Result<()> {
        let config = ServiceConfig::merge(Args::default(), FileConfig::default())?;
        assert_eq!(config.db, PathBuf::from(DEFAULT_DB));
        assert_eq!(config.bind.to_string(), DEFAULT_BIND);
        assert_eq!(config.categories_url, None);
        Ok(())
    }

    #[test]
    fn flags_override_file_values() -> Result<()> {
        let file: FileConfig = serde_yaml::from_str(
            "db: /var/lib/views.sqlite3\nbind: 0.0.0.0:8080\ncategories_url: http://categories:4000\n",
        )?;
        let args = Args { db: Some(PathBuf::from("/tmp/override.sqlite3")), ..Args::default() };

        let config = ServiceConfig::merge(args, file)?;

        assert_eq!(config.db, PathBuf::from("/tmp/override.sqlite3"));
        assert_eq!(config.bind.to_string(), "0.0.0.0:8080");
        assert_eq!(config.categories_url.as_deref(), Some("http://categories:4000"));
        Ok(())
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let parsed = serde_yaml::from_str::<FileConfig>("database: nope\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn config_file_is_loaded_from_disk() -> Result<()> {
        let path = std::env::temp_dir().join(format!("view-ledger-config-{}.yaml", ulid::Ulid::new()));
        std::fs::write(&path, "bind: 127.0.0.1:5050\n")?;
        let args = Args { config: Some(path.clone()), ..Args::default() };

        let config = ServiceConfig::from_args(args)?;

        assert_eq!(config.bind.to_string(), "127.0.0.1:5050");
        assert_eq!(config.db, PathBuf::from(DEFAULT_DB));
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
