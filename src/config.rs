use crate::canonical::DEFAULT_ORIGIN;
use crate::error::{Error, Result};
use crate::session::DEFAULT_DEBOUNCE;
use crate::store::AUTO_EXPORT_THRESHOLD;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for the durable key-value store.
    pub data_dir: PathBuf,
    pub export_dir: PathBuf,
    /// Origin used to resolve relative post links.
    pub site_origin: String,
    pub debounce: Duration,
    pub persist_interval: Duration,
    pub auto_export_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3004,
            data_dir: PathBuf::from(".ticker-data"),
            export_dir: PathBuf::from("exports"),
            site_origin: DEFAULT_ORIGIN.to_string(),
            debounce: DEFAULT_DEBOUNCE,
            persist_interval: Duration::from_secs(30),
            auto_export_threshold: AUTO_EXPORT_THRESHOLD,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            data_dir: lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            export_dir: lookup("EXPORT_DIR").map(PathBuf::from).unwrap_or(defaults.export_dir),
            site_origin: lookup("SITE_ORIGIN").unwrap_or(defaults.site_origin),
            debounce: Duration::from_millis(parse_or(&lookup, "DEBOUNCE_MS", defaults.debounce.as_millis() as u64)),
            persist_interval: Duration::from_secs(parse_or(
                &lookup,
                "PERSIST_INTERVAL_SECS",
                defaults.persist_interval.as_secs(),
            )),
            auto_export_threshold: parse_or(&lookup, "AUTO_EXPORT_THRESHOLD", defaults.auto_export_threshold),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.site_origin.starts_with("http://") && !self.site_origin.starts_with("https://") {
            return Err(Error::Config(format!("SITE_ORIGIN must be an http(s) origin, got {}", self.site_origin)));
        }
        if self.auto_export_threshold == 0 {
            return Err(Error::Config("AUTO_EXPORT_THRESHOLD must be at least 1".into()));
        }
        if self.persist_interval.is_zero() {
            return Err(Error::Config("PERSIST_INTERVAL_SECS must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}
