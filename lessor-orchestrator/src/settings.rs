use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Runtime configuration, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub creation_timeout: Duration,
    pub stop_timeout: Duration,
    pub check_interval: Duration,
    pub deletion_delay: Duration,
    pub allocation_threshold: Duration,
    pub min_remaining_amount: f64,
    pub traefik_config_path: PathBuf,
    pub domain: String,
    pub proxy_upstream_host: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub marketplace: String,
    pub listen_addr: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            creation_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(120),
            check_interval: Duration::from_secs(60),
            deletion_delay: Duration::from_secs(300),
            allocation_threshold: Duration::from_secs(120),
            min_remaining_amount: 0.01,
            traefik_config_path: PathBuf::from("/etc/traefik/config"),
            domain: "examples.com".to_string(),
            proxy_upstream_host: "backend".to_string(),
            database_url: None,
            redis_url: None,
            marketplace: "mock".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();
        let text = |key: &str| {
            lookup(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        Self {
            creation_timeout: secs(&lookup, "INSTANCE_CREATION_TIMEOUT", d.creation_timeout),
            stop_timeout: secs(&lookup, "RENTAL_STOP_TIMEOUT", d.stop_timeout),
            check_interval: secs(&lookup, "INSTANCE_CHECK_INTERVAL", d.check_interval),
            deletion_delay: secs(&lookup, "INSTANCE_DELETION_DELAY", d.deletion_delay),
            allocation_threshold: secs(&lookup, "ALLOCATION_TIMEOUT_THRESHOLD", d.allocation_threshold),
            min_remaining_amount: parsed(&lookup, "ALLOCATION_MIN_REMAINING", d.min_remaining_amount),
            traefik_config_path: text("TRAEFIK_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.traefik_config_path),
            domain: text("DOMAIN").unwrap_or(d.domain),
            proxy_upstream_host: text("PROXY_UPSTREAM_HOST").unwrap_or(d.proxy_upstream_host),
            database_url: text("DATABASE_URL"),
            redis_url: text("REDIS_URL"),
            marketplace: text("MARKETPLACE")
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or(d.marketplace),
            listen_addr: parsed(&lookup, "LISTEN_ADDR", d.listen_addr),
        }
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!("⚠️ invalid value {:?} for {}, using default", raw, key);
            default
        }
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parsed(lookup, key, default.as_secs()))
}
