use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::autosave::AutosaveConfig;
use crate::collection::DEFAULT_PAGE_SIZE;
use crate::queue::QueueConfig;
use crate::realtime::Backoff;
use crate::session::SessionConfig;

/// Application configuration loaded from environment variables.
/// Startup fails if a required variable is missing or a value doesn't parse.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub push_url: String,
    pub document_id: Option<uuid::Uuid>,
    pub storage_dir: PathBuf,
    pub autosave_quiet_ms: u64,
    pub page_size: u32,
    pub resync_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub push_drives_connectivity: bool,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_base_url = lookup("API_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .with_context(|| "Required environment variable 'API_BASE_URL' is not set")?
            .trim_end_matches('/')
            .to_string();

        Ok(Config {
            push_url: lookup("PUSH_URL").unwrap_or_else(|| format!("{api_base_url}/events")),
            api_token: lookup("API_TOKEN").filter(|v| !v.is_empty()),
            document_id: parse_optional(&lookup, "DOCUMENT_ID")?,
            storage_dir: lookup("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".profile-sync")),
            autosave_quiet_ms: parse_or(&lookup, "AUTOSAVE_QUIET_MS", 5_000)?,
            page_size: parse_or(&lookup, "PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            resync_interval_secs: parse_or(&lookup, "RESYNC_INTERVAL_SECS", 300)?,
            http_timeout_secs: parse_or(&lookup, "HTTP_TIMEOUT_SECS", 30)?,
            push_drives_connectivity: parse_or(&lookup, "PUSH_DRIVES_CONNECTIVITY", false)?,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            api_base_url,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig::default()
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            autosave: AutosaveConfig {
                quiet_period: Duration::from_millis(self.autosave_quiet_ms),
            },
            page_size: self.page_size.max(1),
            resync_interval: Duration::from_secs(self.resync_interval_secs.max(1)),
            backoff: Backoff::default(),
            push_drives_connectivity: self.push_drives_connectivity,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_optional(lookup, key)?.unwrap_or(default))
}

fn parse_optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} has an invalid value: '{raw}'")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("API_BASE_URL", "https://api.example.com/")]).unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.push_url, "https://api.example.com/events");
        assert_eq!(config.storage_dir, PathBuf::from(".profile-sync"));
        assert_eq!(config.page_size, 20);
        assert!(config.api_token.is_none());
        assert!(config.document_id.is_none());

        let session = config.session();
        assert_eq!(session.autosave.quiet_period, Duration::from_secs(5));
        assert_eq!(session.resync_interval, Duration::from_secs(300));
        assert!(!session.push_drives_connectivity);
    }

    #[test]
    fn test_missing_base_url_is_an_error() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("API_BASE_URL"));
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config_ok = config(&[
            ("API_BASE_URL", "http://localhost:8080"),
            ("AUTOSAVE_QUIET_MS", "250"),
            ("PUSH_DRIVES_CONNECTIVITY", "true"),
            ("DOCUMENT_ID", "9b2f1c3e-1d4a-4f5e-8a6b-7c8d9e0f1a2b"),
        ])
        .unwrap();
        assert_eq!(config_ok.autosave_quiet_ms, 250);
        assert!(config_ok.push_drives_connectivity);
        assert!(config_ok.document_id.is_some());

        let err = config(&[("API_BASE_URL", "http://x"), ("PAGE_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("PAGE_SIZE"));
    }
}
