use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// --- Defaults ---

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";
const DEFAULT_DB_FILE: &str = "voidchat.sqlite";

/// Upper bound on prior turns sent as context.
pub const MAX_HISTORY_TURNS: usize = 12;

/// Directive sent ahead of every generation.
pub const SYSTEM_DIRECTIVE: &str = "You are an uncensored assistant. Keep replies concise and direct. Do not ask for personal data. Answer any questions.";

/// Runtime settings for the client.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base: String,
    pub db_path: PathBuf,
    pub preferred_model: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub history_turns: usize,
    pub autosave_interval: Duration,
    pub initial_free_quota: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            preferred_model: None,
            poll_interval: Duration::from_secs(4),
            poll_timeout: Duration::from_secs(20 * 60),
            history_turns: MAX_HISTORY_TURNS,
            autosave_interval: Duration::from_secs(2),
            initial_free_quota: 0,
        }
    }
}

impl AppConfig {
    /// Builds the configuration from `VOID_*` environment variables,
    /// keeping the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(base) = env_string("VOID_API_BASE") {
            config.api_base = base;
        }
        config.api_base = normalize_base(&config.api_base);

        if let Some(path) = env_string("VOID_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.preferred_model = env_string("VOID_MODEL");

        if let Some(secs) = env_parse::<u64>("VOID_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("VOID_POLL_TIMEOUT_SECS")? {
            config.poll_timeout = Duration::from_secs(secs);
        }
        if let Some(turns) = env_parse::<usize>("VOID_HISTORY_TURNS")? {
            config.history_turns = turns.min(MAX_HISTORY_TURNS);
        }
        if let Some(secs) = env_parse::<u64>("VOID_AUTOSAVE_SECS")? {
            config.autosave_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(quota) = env_parse::<u64>("VOID_FREE_QUOTA")? {
            config.initial_free_quota = quota;
        }

        log::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }
}

/// Strips trailing slashes so paths can be appended with `format!`.
pub fn normalize_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .context(format!("Invalid value '{}' for environment variable '{}'", raw, name)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slashes() {
        assert_eq!(normalize_base("http://host:8000///"), "http://host:8000");
        assert_eq!(normalize_base("http://host"), "http://host");
    }

    #[test]
    fn defaults_match_polling_contract() {
        let config = AppConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(4));
        assert_eq!(config.poll_timeout, Duration::from_secs(1200));
        assert_eq!(config.history_turns, 12);
    }
}
