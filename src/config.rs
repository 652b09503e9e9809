// Relay configuration, read from a JSON file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::crypto::Keyring;

/// Default state directory: `$HOME/.anonrelay`
pub fn state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".anonrelay")
}

fn default_database() -> PathBuf {
    state_dir().join("queue.db")
}

fn default_spool_dir() -> PathBuf {
    state_dir().join("spool")
}

fn default_local_address() -> String {
    "remailer@localhost".to_string()
}

fn default_inbound_queue() -> String {
    "outbound".to_string()
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_layers() -> usize {
    crate::remailer::DEFAULT_MAX_LAYERS
}

fn default_delivery_batch() -> usize {
    crate::pump::DELETE_BATCH
}

fn default_poll_interval() -> u64 {
    60
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// SQLite queue database
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// `From` address of unwrapped messages
    #[serde(default = "default_local_address")]
    pub local_address: String,

    /// Armored secret key files
    #[serde(default)]
    pub secret_keys: Vec<PathBuf>,

    /// Queue filled by ingestion and drained by the pump
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: String,

    /// Directory of inbound `*.eml` files
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Remove undecodable inbound mail instead of leaving it for inspection
    #[serde(default)]
    pub delete_invalid: bool,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_max_layers")]
    pub max_layers: usize,

    /// Messages delivered per queue transaction
    #[serde(default = "default_delivery_batch")]
    pub delivery_batch: usize,

    /// Daemon loop period in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub smtp: SmtpConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            local_address: default_local_address(),
            secret_keys: Vec::new(),
            inbound_queue: default_inbound_queue(),
            spool_dir: default_spool_dir(),
            delete_invalid: false,
            max_message_size: default_max_message_size(),
            max_layers: default_max_layers(),
            delivery_batch: default_delivery_batch(),
            poll_interval_secs: default_poll_interval(),
            smtp: SmtpConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load `path`, or the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Build the keyring from `secret_keys`
    pub fn keyring(&self) -> Result<Keyring> {
        Keyring::load_files(&self.secret_keys).context("Failed to load secret keys")
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

/// Egress relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// AUTH user, used when the server offers AUTH
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Reuse one connection for a whole pump pass
    #[serde(default = "default_true")]
    pub persistent: bool,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// EHLO name, the local hostname when unset
    #[serde(default)]
    pub hello_name: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            persistent: true,
            timeout_secs: default_timeout(),
            hello_name: None,
        }
    }
}
