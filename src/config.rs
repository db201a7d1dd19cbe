//! Configuration loading from `.env` files.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};

use crate::{cache::DEFAULT_TTL, relay::DEFAULT_TIMEOUT};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// Lifetime of a cached query result.
    pub cache_ttl: Duration,
    /// Upper bound on one relay round trip.
    pub fetch_timeout: Duration,
    /// Relays used for publishing and CLI queries.
    pub relays_default: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// JSON file holding local profiles.
    pub profile_store: PathBuf,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP is required")?;
        let cache_ttl = secs_var("CACHE_TTL_SECS")?.unwrap_or(DEFAULT_TTL);
        let fetch_timeout = secs_var("FETCH_TIMEOUT_SECS")?.unwrap_or(DEFAULT_TIMEOUT);
        let relays_default = csv_strings(env::var("RELAYS_DEFAULT").unwrap_or_default());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let profile_store = env::var("PROFILE_STORE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| env_dir(path).join("profiles.json"));
        let log_format = match env::var("LOG_FORMAT").unwrap_or_default().as_str() {
            "json" => LogFormat::Json,
            "" | "compact" => LogFormat::Compact,
            other => bail!("unknown LOG_FORMAT {other:?}"),
        };
        Ok(Self {
            bind_http,
            cache_ttl,
            fetch_timeout,
            relays_default,
            tor_socks,
            profile_store,
            log_format,
        })
    }
}

/// Directory containing the env file, for resolving relative defaults.
pub fn env_dir(path: &str) -> PathBuf {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn secs_var(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            let secs: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a number of seconds"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        _ => Ok(None),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
