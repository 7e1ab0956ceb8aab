use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Upper bound on concurrent detail fetches, whatever the config says.
pub const MAX_CONCURRENCY: usize = 4;

/// Top-level application configuration. Built once per run and never mutated.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub register: RegisterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Register (HTTP) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Politeness delay before every request.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,

    /// Substring every accepted page must contain. Empty disables the check
    /// beyond requiring a non-empty body.
    #[serde(default = "default_content_marker")]
    pub content_marker: String,

    #[serde(default)]
    pub proxy_url: Option<String>,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory of the blob store; one object per trial below it.
    #[serde(default = "default_blob_root")]
    pub blob_root: PathBuf,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_record_table")]
    pub record_table: String,

    /// Keep one blob per capture instead of overwriting the trial's blob.
    #[serde(default)]
    pub historize: bool,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://www.clinicaltrialsregister.eu".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    1000
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    2000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_user_agent() -> String {
    "euctr-scraper/0.1 (clinical trial register research)".to_string()
}
fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "Accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
    )])
}
fn default_content_marker() -> String {
    "Clinical Trials Register".to_string()
}
fn default_blob_root() -> PathBuf {
    PathBuf::from("data/blobs")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/trials.duckdb")
}
fn default_record_table() -> String {
    "trials".to_string()
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    1
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            user_agent: default_user_agent(),
            headers: default_headers(),
            content_marker: default_content_marker(),
            proxy_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_root: default_blob_root(),
            db_path: default_db_path(),
            record_table: default_record_table(),
            historize: false,
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self, ConfigurationError> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("EUCTR").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize()?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        url::Url::parse(&self.register.base_url)?;
        validate_identifier(&self.storage.record_table)?;
        Ok(())
    }
}

impl PipelineConfig {
    /// Worker limit actually used: at least 1, at most `MAX_CONCURRENCY`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// The record table name is interpolated into SQL, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> Result<(), ConfigurationError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidTableName(name.to_string()))
    }
}
