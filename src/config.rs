use crate::adapters::outbound::{IPAPI_FREE_URL, IPAPI_MAX_BATCH, IPAPI_PRO_URL};
use crate::infrastructure::DEFAULT_CACHE_CAPACITY;
use serde::Deserialize;
use std::str::FromStr;

/// Invalid process configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{var} must be between {min} and {max}, got {value}")]
    OutOfRange {
        var: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // HTTP front end
    pub listen_addr: String,
    pub submit_timeout_secs: u64,
    pub max_batch_request: usize,
    pub shutdown_grace_secs: u64,
    pub debug: bool,

    // Cache
    pub cache_size: usize,

    // Batching
    pub batch_size: usize,
    pub batch_delay_ms: u64,

    // Upstream
    pub ipapi_url: String,
    pub ipapi_key: Option<String>,
    pub ipapi_rate_limit: u64,
    pub fetch_timeout_secs: u64,
    pub fetch_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            submit_timeout_secs: 30,
            max_batch_request: 100,
            shutdown_grace_secs: 10,
            debug: false,
            cache_size: DEFAULT_CACHE_CAPACITY,
            batch_size: IPAPI_MAX_BATCH,
            batch_delay_ms: 50,
            ipapi_url: IPAPI_FREE_URL.to_string(),
            ipapi_key: None,
            ipapi_rate_limit: 15,
            fetch_timeout_secs: 10,
            fetch_retries: 2,
        }
    }
}

/// Read a numeric variable, falling back to `default` when unset.
///
/// A variable that is set but does not parse is an error rather than a
/// silent fallback.
fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

fn check_range(var: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            var,
            value,
            min,
            max,
        });
    }
    Ok(())
}

pub fn load_config() -> Result<Config, ConfigError> {
    let defaults = Config::default();

    let listen_addr = std::env::var("LISTEN")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or(defaults.listen_addr);

    let cache_size = parse_var("CACHE_SIZE", defaults.cache_size)?;

    let ipapi_key = std::env::var("IPAPI_KEY").ok().filter(|v| !v.is_empty());

    // The free endpoint does not accept keys
    let ipapi_url = std::env::var("IPAPI_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| match ipapi_key {
            Some(_) => IPAPI_PRO_URL.to_string(),
            None => IPAPI_FREE_URL.to_string(),
        });

    let ipapi_rate_limit = parse_var("IPAPI_RATE_LIMIT", defaults.ipapi_rate_limit)?;
    check_range("IPAPI_RATE_LIMIT", ipapi_rate_limit, 1, u64::MAX)?;

    let batch_size: usize = parse_var("BATCH_SIZE", defaults.batch_size)?;
    check_range("BATCH_SIZE", batch_size as u64, 1, IPAPI_MAX_BATCH as u64)?;

    let batch_delay_ms = parse_var("BATCH_DELAY_MS", defaults.batch_delay_ms)?;
    let fetch_timeout_secs = parse_var("FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs)?;
    let fetch_retries = parse_var("FETCH_RETRIES", defaults.fetch_retries)?;
    let submit_timeout_secs = parse_var("SUBMIT_TIMEOUT_SECS", defaults.submit_timeout_secs)?;
    let max_batch_request = parse_var("MAX_BATCH_REQUEST", defaults.max_batch_request)?;
    let shutdown_grace_secs = parse_var("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs)?;

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        listen_addr,
        submit_timeout_secs,
        max_batch_request,
        shutdown_grace_secs,
        debug,
        cache_size,
        batch_size,
        batch_delay_ms,
        ipapi_url,
        ipapi_key,
        ipapi_rate_limit,
        fetch_timeout_secs,
        fetch_retries,
    })
}
