use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use crate::model::{Account, ProviderKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Authentication method for an account
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Password authentication (IMAP/SMTP only)
    #[default]
    Password,
    /// OAuth2 refresh-token flow; the refresh token lives in the credential store
    OAuth2 {
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
    },
}

/// Remote backend and its connection details
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Outlook,
    Gmail,
    Imap { imap: ImapConfig, smtp: SmtpConfig },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable local identifier, used as the cache key
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub auth: AuthMethod,
}

impl AccountConfig {
    pub fn provider_kind(&self) -> ProviderKind {
        match self.provider {
            ProviderConfig::Outlook => ProviderKind::Outlook,
            ProviderConfig::Gmail => ProviderKind::Gmail,
            ProviderConfig::Imap { .. } => ProviderKind::Imap,
        }
    }

    pub fn to_account(&self) -> Account {
        let mut account = Account::new(&self.id, &self.email, self.provider_kind());
        account.display_name = self.display_name.clone();
        account
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmtpConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between scheduled full syncs per account
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    /// Seconds between retry-queue sweeps
    #[serde(default = "default_retry_sweep_interval_secs")]
    pub retry_sweep_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            retry_sweep_interval_secs: default_retry_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Database file override (default: data dir / cache.db)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_retry_sweep_interval_secs() -> u64 {
    3600
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mailsync");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("mailsync");
        Ok(dir)
    }

    pub fn cache_path(&self) -> Result<PathBuf> {
        match &self.cache.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("cache.db")),
        }
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[accounts]]\n\
                 id = \"personal\"\n\
                 email = \"you@example.com\"\n\n\
                 [accounts.provider]\n\
                 kind = \"imap\"\n\n\
                 [accounts.provider.imap]\n\
                 server = \"imap.example.com\"\n\n\
                 [accounts.provider.smtp]\n\
                 server = \"smtp.example.com\"",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                anyhow::bail!("Duplicate account id '{}'", account.id);
            }
            let rest = matches!(account.provider, ProviderConfig::Outlook | ProviderConfig::Gmail);
            if rest && account.auth == AuthMethod::Password {
                anyhow::bail!(
                    "Account '{}' uses a REST provider and needs oauth2 authentication",
                    account.id
                );
            }
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        fs::create_dir_all(Self::data_dir()?)?;
        Ok(())
    }
}
