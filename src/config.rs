use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const LISTING_URL: &str = "https://job.rikunabi.com/2026/s/";
pub const PAGE_PARAM: &str = "pn";
pub const DETAIL_PATH_MARKER: &str = "/2026/company/r";
pub const EXCLUDED_SEGMENTS: [&str; 2] = ["/seminars/", "/entries/"];
pub const SEARCH_LABEL: &str = "企業検索";
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

pub const TOTAL_RECORDS: u32 = 11_976;
pub const PAGE_SIZE: u32 = 100;
pub const BATCH_SIZE: usize = 20;
pub const DETAIL_DELAY_MS: u64 = 500;
pub const PAGE_DELAY_MS: u64 = 1000;

const DB_PATH: &str = "data/harvest.sqlite";
const SETTINGS_FILE: &str = "harvest";
const ENV_PREFIX: &str = "HARVEST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Supabase table over PostgREST
    Remote,
    /// SQLite table next to the checkpoint database
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listing_url: String,
    pub page_param: String,
    pub detail_path_marker: String,
    pub excluded_segments: Vec<String>,
    pub search_label: String,
    pub user_agent: String,
    pub total_records: u32,
    pub page_size: u32,
    pub batch_size: usize,
    pub detail_delay_ms: u64,
    pub page_delay_ms: u64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub db_path: PathBuf,
    pub store: StoreKind,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listing_url: LISTING_URL.to_string(),
            page_param: PAGE_PARAM.to_string(),
            detail_path_marker: DETAIL_PATH_MARKER.to_string(),
            excluded_segments: EXCLUDED_SEGMENTS.iter().map(|s| s.to_string()).collect(),
            search_label: SEARCH_LABEL.to_string(),
            user_agent: USER_AGENT.to_string(),
            total_records: TOTAL_RECORDS,
            page_size: PAGE_SIZE,
            batch_size: BATCH_SIZE,
            detail_delay_ms: DETAIL_DELAY_MS,
            page_delay_ms: PAGE_DELAY_MS,
            timeout_secs: 30,
            max_retries: 2,
            base_backoff_ms: 1000,
            db_path: PathBuf::from(DB_PATH),
            store: StoreKind::Remote,
        }
    }
}

impl Settings {
    /// Defaults, then `harvest.toml` if present, then `HARVEST_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_environment(environment())
    }

    fn from_environment(env: config::Environment) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(SETTINGS_FILE).required(false))
            .add_source(env)
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Last listing page, from the record estimate and the page size.
    pub fn last_page(&self) -> u32 {
        let page_size = self.page_size.max(1);
        self.total_records.div_ceil(page_size)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            batch_size: self.batch_size.max(1),
            detail_delay: Duration::from_millis(self.detail_delay_ms),
            page_delay: Duration::from_millis(self.page_delay_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `HARVEST_*` variables; `HARVEST_EXCLUDED_SEGMENTS` is comma separated.
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("excluded_segments")
}

/// Batch threshold and the two politeness delays.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub batch_size: usize,
    pub detail_delay: Duration,
    pub page_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Supabase project URL and API key.
#[derive(Clone)]
pub struct StoreCredentials {
    pub url: String,
    pub key: String,
}

const URL_VARS: [&str; 2] = ["SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_URL"];
const KEY_VARS: [&str; 2] = ["SUPABASE_KEY", "NEXT_PUBLIC_SUPABASE_ANON_KEY"];

impl StoreCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| {
            names
                .iter()
                .filter_map(|n| lookup(n))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };
        let url = first(&URL_VARS).ok_or(ConfigError::MissingCredentials(URL_VARS[0]))?;
        let key = first(&KEY_VARS).ok_or(ConfigError::MissingCredentials(KEY_VARS[0]))?;
        Ok(StoreCredentials { url, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_page_rounds_up() {
        let s = Settings::default();
        assert_eq!(s.last_page(), 120);

        let s = Settings { total_records: 200, page_size: 100, ..Settings::default() };
        assert_eq!(s.last_page(), 2);
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy { max_retries: 3, base_backoff: Duration::from_millis(100) };
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let err = StoreCredentials::from_lookup(vars(&[])).err().unwrap();
        assert!(matches!(err, ConfigError::MissingCredentials("SUPABASE_URL")));

        let err = StoreCredentials::from_lookup(vars(&[("SUPABASE_URL", "https://x.supabase.co")]))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingCredentials("SUPABASE_KEY")));
    }

    #[test]
    fn falls_back_to_public_variables() {
        let creds = StoreCredentials::from_lookup(vars(&[
            ("NEXT_PUBLIC_SUPABASE_URL", "https://x.supabase.co"),
            ("NEXT_PUBLIC_SUPABASE_ANON_KEY", "anon"),
        ]))
        .unwrap();
        assert_eq!(creds.url, "https://x.supabase.co");
        assert_eq!(creds.key, "anon");
    }

    #[test]
    fn blank_credentials_count_as_missing() {
        let err = StoreCredentials::from_lookup(vars(&[
            ("SUPABASE_URL", "   "),
            ("SUPABASE_KEY", "service"),
        ]))
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::MissingCredentials("SUPABASE_URL")));

        let creds = StoreCredentials::from_lookup(vars(&[
            ("SUPABASE_URL", " "),
            ("NEXT_PUBLIC_SUPABASE_URL", " https://x.supabase.co "),
            ("SUPABASE_KEY", "service"),
        ]))
        .unwrap();
        assert_eq!(creds.url, "https://x.supabase.co");
    }

    #[test]
    fn excluded_segments_from_comma_list() {
        let env: config::Map<String, String> = [
            ("HARVEST_EXCLUDED_SEGMENTS", "/seminars/,/entries/,/interns/"),
            ("HARVEST_BATCH_SIZE", "5"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let s = Settings::from_environment(environment().source(Some(env))).unwrap();
        assert_eq!(s.excluded_segments, vec!["/seminars/", "/entries/", "/interns/"]);
        assert_eq!(s.batch_size, 5);
        assert_eq!(s.listing_url, LISTING_URL);
    }
}
