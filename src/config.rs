//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fmt::{Debug, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::persistence::sweeper::DEFAULT_STALE_AFTER_SECONDS;
use crate::{AppError, Result};

/// Keychain service name used for stored credentials.
const KEYRING_SERVICE: &str = "adt-locksmith";

/// Credentials attached to every remote request.
///
/// Loaded at runtime from the OS keychain or environment, never from the
/// TOML file.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// No authorization header.
    #[default]
    None,
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// Bearer token.
    Bearer {
        /// Token value.
        token: String,
    },
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Where sessions and lock records are stored, and when they go stale.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Directory for session records.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// Directory holding the lock registry database.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    /// Age after which sessions and lock records are swept.
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_dir: None,
            lock_dir: None,
            stale_after_seconds: default_stale_after_seconds(),
        }
    }
}

/// Operation chain behaviour.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChainConfig {
    /// Activate the object after a successful update.
    #[serde(default = "default_true")]
    pub activate: bool,
    /// Delete a partially created object when a create chain fails.
    #[serde(default)]
    pub delete_on_failure: bool,
    /// Long-poll budget for post-unlock and post-activation reads.
    #[serde(default = "default_consistency_timeout")]
    pub consistency_timeout_seconds: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            activate: true,
            delete_on_failure: false,
            consistency_timeout_seconds: default_consistency_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stale_after_seconds() -> u64 {
    DEFAULT_STALE_AFTER_SECONDS
}

fn default_consistency_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Server base URL, e.g. `https://dev.example.com:44300`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// `sap-client` value appended to every request.
    #[serde(default)]
    pub client: Option<String>,
    /// `Accept-Language` value.
    #[serde(default)]
    pub language: Option<String>,
    /// Timeout applied to every remote call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Storage locations and staleness threshold.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Chain behaviour.
    #[serde(default)]
    pub chain: ChainConfig,
    /// Credentials (populated at runtime).
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            client: None,
            language: None,
            request_timeout_seconds: default_request_timeout(),
            storage: StorageConfig::default(),
            chain: ChainConfig::default(),
            credentials: Credentials::None,
        }
    }
}

impl GlobalConfig {
    /// Defaults for a run without a config file.
    #[must_use]
    pub fn default_for(base_url: Option<String>) -> Self {
        Self {
            base_url,
            ..Self::default()
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill unset values from the environment (`ADT_BASE_URL`, `ADT_CLIENT`).
    pub fn apply_env(&mut self) {
        if self.base_url.is_none() {
            self.base_url = env::var("ADT_BASE_URL").ok().filter(|v| !v.is_empty());
        }
        if self.client.is_none() {
            self.client = env::var("ADT_CLIENT").ok().filter(|v| !v.is_empty());
        }
    }

    /// Load credentials from the OS keychain with env-var fallback.
    ///
    /// A bearer token (`token` keychain entry or `ADT_TOKEN`) wins over basic
    /// credentials (`username`/`password` entries or `ADT_USERNAME` /
    /// `ADT_PASSWORD`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither source provides credentials.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if let Some(token) = load_credential("token", "ADT_TOKEN").await? {
            self.credentials = Credentials::Bearer { token };
            return Ok(());
        }
        let username = load_credential("username", "ADT_USERNAME").await?;
        let password = load_credential("password", "ADT_PASSWORD").await?;
        match (username, password) {
            (Some(username), Some(password)) => {
                self.credentials = Credentials::Basic { username, password };
                Ok(())
            }
            _ => Err(AppError::Config(
                "no credentials found in keychain or ADT_TOKEN / ADT_USERNAME + ADT_PASSWORD"
                    .into(),
            )),
        }
    }

    /// Configured base URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no base URL is set.
    pub fn require_base_url(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .ok_or_else(|| AppError::Config("base_url is not configured (or ADT_BASE_URL)".into()))
    }

    /// Directory for session records.
    #[must_use]
    pub fn session_dir(&self) -> PathBuf {
        self.storage
            .session_dir
            .clone()
            .unwrap_or_else(|| data_root().join("sessions"))
    }

    /// Path of the lock registry database.
    #[must_use]
    pub fn lock_db_path(&self) -> PathBuf {
        self.storage
            .lock_dir
            .clone()
            .unwrap_or_else(|| data_root().join("locks"))
            .join("locks.db")
    }

    /// Staleness threshold for sweeps.
    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.storage.stale_after_seconds).unwrap_or(i64::MAX))
    }

    /// Timeout applied to every remote call.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Long-poll budget for consistency reads.
    #[must_use]
    pub fn consistency_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.consistency_timeout_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(base_url) = &self.base_url {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(AppError::Config(format!(
                    "base_url must start with http:// or https://: {base_url}"
                )));
            }
        }

        if self.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "request_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.storage.stale_after_seconds == 0 {
            return Err(AppError::Config(
                "stale_after_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Root for default storage: `$ADT_LOCKSMITH_HOME`, else `~/.adt-locksmith`,
/// else `./.adt-locksmith`.
fn data_root() -> PathBuf {
    if let Some(home) = env::var_os("ADT_LOCKSMITH_HOME") {
        return PathBuf::from(home);
    }
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(".adt-locksmith")
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(keyring::Error::NoEntry) => {}
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    Ok(env::var(env_key).ok().filter(|value| !value.is_empty()))
}
