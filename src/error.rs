use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("invalid url {0}: {1}")]
    Url(String, url::ParseError),
}

impl FetchError {
    /// Rate limiting and server-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Url(..) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store response carried no row count")]
    MissingCount,
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing store credentials: set {0}")]
    MissingCredentials(&'static str),
    #[error("invalid settings: {0}")]
    Load(#[from] config::ConfigError),
}
