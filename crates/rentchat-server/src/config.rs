use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use rentchat_gateway::config::GatewayConfig;

/// Process configuration, read from `RENTCHAT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    pub jwt_secret: String,
    /// Unset means the in-process store; only valid for a single instance.
    pub redis_url: Option<String>,
    /// Period of the background drain; `None` disables it.
    pub flush_interval: Option<Duration>,
    pub store_workers: usize,
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            buffer_threshold: parse(&lookup, "RENTCHAT_BUFFER_THRESHOLD", defaults.buffer_threshold)?,
            history_page: parse(&lookup, "RENTCHAT_HISTORY_PAGE", defaults.history_page)?,
            flush_max_attempts: parse(&lookup, "RENTCHAT_FLUSH_MAX_ATTEMPTS", defaults.flush_max_attempts)?,
            flush_backoff: Duration::from_millis(parse(&lookup, "RENTCHAT_FLUSH_BACKOFF_MS", 10u64)?),
        };
        let flush_interval = match parse(&lookup, "RENTCHAT_FLUSH_INTERVAL_SECS", 60u64)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            host: string("RENTCHAT_HOST", "0.0.0.0"),
            port: parse(&lookup, "RENTCHAT_PORT", 3000)?,
            db_path: string("RENTCHAT_DB_PATH", "rentchat.db").into(),
            media_dir: string("RENTCHAT_MEDIA_DIR", "media").into(),
            jwt_secret: string("RENTCHAT_JWT_SECRET", "dev-secret-change-me"),
            redis_url: lookup("RENTCHAT_REDIS_URL").filter(|url| !url.is_empty()),
            flush_interval,
            store_workers: parse(&lookup, "RENTCHAT_STORE_WORKERS", 64usize)?.max(1),
            gateway,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
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
    fn defaults_match_documented_values() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.gateway.buffer_threshold, 100);
        assert_eq!(config.gateway.history_page, 30);
        assert_eq!(config.gateway.flush_max_attempts, 5);
        assert_eq!(config.flush_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.store_workers, 64);
        assert!(config.redis_url.is_none());
        assert_eq!(config.addr().unwrap().port(), 3000);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("RENTCHAT_BUFFER_THRESHOLD", "5"),
            ("RENTCHAT_FLUSH_INTERVAL_SECS", "0"),
            ("RENTCHAT_REDIS_URL", "redis://cache:6379"),
            ("RENTCHAT_FLUSH_BACKOFF_MS", "25"),
        ])
        .unwrap();
        assert_eq!(config.gateway.buffer_threshold, 5);
        assert_eq!(config.gateway.flush_backoff, Duration::from_millis(25));
        assert!(config.flush_interval.is_none());
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = config(&[("RENTCHAT_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("RENTCHAT_PORT"));
    }
}
