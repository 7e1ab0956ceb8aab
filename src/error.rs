use std::path::PathBuf;
use thiserror::Error;

/// Terminal failure of a page fetch after the retry policy gave up.
#[derive(Debug, Clone, Error)]
#[error("fetch {url} failed after {attempts} attempt(s) (last status: {}): {reason}", display_status(.last_status))]
pub struct FetchError {
    pub url: String,
    pub last_status: Option<u16>,
    pub attempts: u32,
    pub reason: String,
}

fn display_status(status: &Option<u16>) -> String {
    status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string())
}

impl FetchError {
    /// True when no HTTP response was ever received (connection-level loss).
    pub fn is_connection_loss(&self) -> bool {
        self.last_status.is_none()
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },

    #[error("search outcome not recognised: {0:?}")]
    UnrecognisedOutcome(String),

    #[error("field {field} missing")]
    MissingField { field: &'static str },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("blob write {key} failed: {source}")]
    Blob {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialising capture {trial_id} failed: {source}")]
    Serialize {
        trial_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record store write for {trial_id} failed: {source}")]
    Record {
        trial_id: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("record store: {0}")]
    Database(#[from] duckdb::Error),

    #[error("record store connection poisoned")]
    Poisoned,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("could not create {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("provide either --start-date/--end-date or --start-page/--end-page")]
    MissingRange,

    #[error("date range and page range are mutually exclusive")]
    BothModes,

    #[error("both start and end dates must be provided")]
    IncompleteDateRange,

    #[error("both start and end pages must be provided")]
    IncompletePageRange,

    #[error("range start {start} is after range end {end}")]
    StartAfterEnd { start: String, end: String },

    #[error("page numbers start at 1")]
    ZeroPage,

    #[error("invalid record table identifier {0:?}")]
    InvalidTableName(String),

    #[error("invalid header {name:?}: {message}")]
    InvalidHeader { name: String, message: String },

    #[error("invalid register url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("configuration load failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Errors that abort a whole run. Everything else is recorded per trial.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("date range resolution failed: {0}")]
    Resolve(#[from] FetchError),

    #[error("date range resolution failed: {0}")]
    Outcome(#[from] ParseError),

    #[error("infrastructure unavailable: {0}")]
    Infrastructure(String),
}
