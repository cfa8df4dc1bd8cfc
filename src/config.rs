// ⚙️ Configuration
//
// Sources, later overrides earlier:
// 1. `docinc.toml` in the working directory (optional)
// 2. File passed to `CoreConfig::load` (required when given)
// 3. Environment variables prefixed `DOCINC__` (e.g. DOCINC__DATABASE_PATH)

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Default configuration file name (without extension)
pub const DEFAULT_CONFIG_FILE: &str = "docinc";
/// Prefix for configuration environment variables
pub const CONFIG_ENV_PREFIX: &str = "DOCINC";
/// Environment variable read by the server for the tracing filter
pub const LOG_ENV_VAR: &str = "DOCINC_LOG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// HTTP listen address for the server binary
    pub bind_addr: String,

    /// Upper bound for a single transport delivery
    pub notification_timeout_ms: u64,

    /// How long a successful verify may be consumed by a link
    pub verification_ttl_secs: i64,

    pub min_password_length: usize,

    /// Rows fetched per page by audit queries
    pub audit_page_size: usize,

    /// CSV of `account_number,last4_ssn` loaded at startup
    pub seed_accounts_csv: Option<PathBuf>,

    /// CSV of statements produced by the statement generator
    pub seed_statements_csv: Option<PathBuf>,

    /// Fallback tracing filter when `DOCINC_LOG` is unset
    pub log_filter: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("docinc.db"),
            bind_addr: "0.0.0.0:3000".to_string(),
            notification_timeout_ms: 5_000,
            verification_ttl_secs: 300,
            min_password_length: 8,
            audit_page_size: 100,
            seed_accounts_csv: None,
            seed_statements_csv: None,
            log_filter: "doc_inc=info".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from file(s) and environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Toml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: CoreConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.notification_timeout_ms == 0 {
            anyhow::bail!("notification_timeout_ms must be greater than zero");
        }
        if self.verification_ttl_secs <= 0 {
            anyhow::bail!("verification_ttl_secs must be greater than zero");
        }
        if self.audit_page_size == 0 {
            anyhow::bail!("audit_page_size must be greater than zero");
        }
        Ok(())
    }

    pub fn notification_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn verification_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.verification_ttl_secs)
    }

    /// Config for tests: in-memory friendly defaults, short timeouts
    pub fn for_test() -> Self {
        Self {
            notification_timeout_ms: 200,
            audit_page_size: 2,
            ..Self::default()
        }
    }
}
