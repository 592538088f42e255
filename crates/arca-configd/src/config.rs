//! Layered process configuration (§6 "Process configuration").
//!
//! Later layers override earlier ones:
//! 1. built-in defaults
//! 2. global file: `<config_dir>/arca-configd/config.toml` (via the
//!    `directories` crate)
//! 3. project-local file: `./arca-configd.toml`
//! 4. environment variables: `ARCA_CONFIGD_*`
//!
//! The merged result selects and parameterizes the storage backend
//! (§4.1), the lock manager's default TTL and reaper interval (§4.2), the
//! audit sink's retention window (§4.5), and the `tracing_subscriber`
//! filter directive used by [`init_tracing`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::storage::{DEFAULT_IO_TIMEOUT, DEFAULT_LOCK_TIMEOUT};

const ENV_PREFIX: &str = "ARCA_CONFIGD_";
const PROJECT_CONFIG_FILE: &str = "arca-configd.toml";
const DEFAULT_SQLITE_PATH: &str = "/var/lib/arca-router/config.db";
const DEFAULT_ETCD_PREFIX: &str = "/arca-router/";

/// Which storage engine backs the `ConfigStore` (§4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Etcd,
}

/// SQLite-specific connection options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    pub path: String,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: DEFAULT_SQLITE_PATH.to_string(),
        }
    }
}

/// TLS material for the replicated backend. Presence of any field enables
/// TLS and enforces a minimum of TLS 1.2 (§6).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EtcdTlsOptions {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
}

impl EtcdTlsOptions {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.cert_file.is_some() || self.key_file.is_some() || self.ca_file.is_some()
    }
}

/// Etcd-specific connection options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtcdOptions {
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: EtcdTlsOptions,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            prefix: DEFAULT_ETCD_PREFIX.to_string(),
            timeout_secs: DEFAULT_IO_TIMEOUT.as_secs(),
            username: None,
            password: None,
            tls: EtcdTlsOptions::default(),
        }
    }
}

impl EtcdOptions {
    /// Ensure the prefix carries exactly one trailing slash (§6).
    #[must_use]
    pub fn normalized_prefix(&self) -> String {
        if self.prefix.ends_with('/') {
            self.prefix.clone()
        } else {
            format!("{}/", self.prefix)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Validation(
                "etcd backend requires at least one endpoint".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage backend selection and its options (§4.1, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub sqlite: SqliteOptions,
    pub etcd: EtcdOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            sqlite: SqliteOptions::default(),
            etcd: EtcdOptions::default(),
        }
    }
}

/// Lock manager defaults (§4.2, §5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_timeout_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            reaper_interval_secs: 5 * 60,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Audit sink retention (§4.5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub retention_days: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

impl AuditConfig {
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

/// Filter directive for `tracing_subscriber::EnvFilter` (§6 "Logging").
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// The full layered configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == Backend::Etcd {
            self.store.etcd.validate()?;
        }
        Ok(())
    }

    /// Merge `other`'s explicitly-set environment overrides into `self`.
    /// Only the handful of keys named in §6 are supported; unknown
    /// variables are ignored rather than rejected, since third parties may
    /// set `ARCA_CONFIGD_*` variables this crate does not yet know about.
    fn apply_env_vars(&mut self) {
        if let Ok(raw) = std::env::var(format!("{ENV_PREFIX}BACKEND")) {
            match raw.to_lowercase().as_str() {
                "sqlite" => self.store.backend = Backend::Sqlite,
                "etcd" => self.store.backend = Backend::Etcd,
                _ => {}
            }
        }
        if let Ok(path) = std::env::var(format!("{ENV_PREFIX}SQLITE_PATH")) {
            self.store.sqlite.path = path;
        }
        if let Ok(raw) = std::env::var(format!("{ENV_PREFIX}ETCD_ENDPOINTS")) {
            self.store.etcd.endpoints = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        }
        if let Ok(prefix) = std::env::var(format!("{ENV_PREFIX}ETCD_PREFIX")) {
            self.store.etcd.prefix = prefix;
        }
        if let Ok(raw) = std::env::var(format!("{ENV_PREFIX}ETCD_TIMEOUT_SECS")) {
            if let Ok(secs) = raw.parse() {
                self.store.etcd.timeout_secs = secs;
            }
        }
        if let Ok(user) = std::env::var(format!("{ENV_PREFIX}ETCD_USERNAME")) {
            self.store.etcd.username = Some(user);
        }
        if let Ok(pass) = std::env::var(format!("{ENV_PREFIX}ETCD_PASSWORD")) {
            self.store.etcd.password = Some(pass);
        }
        if let Ok(raw) = std::env::var(format!("{ENV_PREFIX}LOCK_TIMEOUT_SECS")) {
            if let Ok(secs) = raw.parse() {
                self.lock.default_timeout_secs = secs;
            }
        }
        if let Ok(raw) = std::env::var(format!("{ENV_PREFIX}AUDIT_RETENTION_DAYS")) {
            if let Ok(days) = raw.parse() {
                self.audit.retention_days = days;
            }
        }
        if let Ok(filter) = std::env::var(format!("{ENV_PREFIX}LOG_FILTER")) {
            self.logging.filter = filter;
        }
    }
}

fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "arca-configd")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn project_config_path() -> PathBuf {
    PathBuf::from(PROJECT_CONFIG_FILE)
}

async fn load_toml_file(path: &Path) -> Result<Option<AppConfig>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let parsed: AppConfig = toml::from_str(&contents)
                .map_err(|e| Error::Validation(format!("malformed config file {}: {e}", path.display())))?;
            Ok(Some(parsed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::internal(format!("failed to read config file {}", path.display()), e)),
    }
}

/// Load the layered configuration: defaults, then global file, then
/// project-local file, then environment variables. Each file layer, when
/// present, replaces the whole previous layer's sections wholesale rather
/// than performing field-level merge, since `AppConfig`'s sub-structs are
/// the smallest unit a caller is expected to override at once.
pub async fn load() -> Result<AppConfig> {
    let mut config = AppConfig::default();

    if let Some(global_path) = global_config_path() {
        if let Some(loaded) = load_toml_file(&global_path).await? {
            config = loaded;
        }
    }

    if let Some(loaded) = load_toml_file(&project_config_path()).await? {
        config = loaded;
    }

    config.apply_env_vars();
    config.validate()?;
    Ok(config)
}

/// Install a `tracing_subscriber` layer using `logging.filter` as the
/// `EnvFilter` directive. Initialization of a subscriber is otherwise the
/// embedding binary's responsibility; this is a convenience for small
/// services that link this crate directly (§6 "Logging").
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_sqlite_backend() {
        let config = AppConfig::default();
        assert_eq!(config.store.backend, Backend::Sqlite);
        assert_eq!(config.store.sqlite.path, DEFAULT_SQLITE_PATH);
    }

    #[test]
    fn etcd_prefix_gets_trailing_slash() {
        let mut opts = EtcdOptions::default();
        opts.prefix = "/custom".to_string();
        assert_eq!(opts.normalized_prefix(), "/custom/");
    }

    #[test]
    fn validate_rejects_etcd_backend_without_endpoints() {
        let config = AppConfig {
            store: StoreConfig {
                backend: Backend::Etcd,
                ..StoreConfig::default()
            },
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn parses_minimal_toml_document() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [store]
            backend = "etcd"

            [store.etcd]
            endpoints = ["https://etcd-0:2379"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.store.backend, Backend::Etcd);
        assert_eq!(parsed.store.etcd.endpoints, vec!["https://etcd-0:2379"]);
    }
}
