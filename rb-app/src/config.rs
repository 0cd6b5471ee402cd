//! Relaybot configuration, read once from the process environment.
//!
//! A `.env` file in the working directory is loaded first when present;
//! variables already set in the environment win over it.

use rb_backend::BackendConfig;
use reqwest::Url;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_BACKEND_A_URL: &str = "BACKEND_A_URL";
pub const ENV_BACKEND_A_TOKEN: &str = "BACKEND_A_TOKEN";
pub const ENV_BACKEND_B_URL: &str = "BACKEND_B_URL";
pub const ENV_BACKEND_B_TOKEN: &str = "BACKEND_B_TOKEN";
pub const ENV_PORT: &str = "PORT";
pub const ENV_DEBOUNCE_SECONDS: &str = "RELAYBOT_DEBOUNCE_SECONDS";
pub const ENV_BACKEND_TIMEOUT_SECONDS: &str = "RELAYBOT_BACKEND_TIMEOUT_SECONDS";
pub const ENV_HTTP_TIMEOUT_SECONDS: &str = "RELAYBOT_HTTP_TIMEOUT_SECONDS";
pub const ENV_HTTP_MAX_IN_FLIGHT: &str = "RELAYBOT_HTTP_MAX_IN_FLIGHT";

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_DEBOUNCE_SECONDS: u64 = 10;
const DEFAULT_BACKEND_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_HTTP_MAX_IN_FLIGHT: usize = 64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub telegram: TelegramConfig,
    pub classifier: BackendConfig,
    pub escalation: BackendConfig,
    pub router: RouterConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub debounce_seconds: u64,
    pub backend_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub http_timeout_seconds: u64,
    pub http_max_in_flight: usize,
}

impl RelayConfig {
    pub fn load() -> anyhow::Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(path = %path.display(), "loaded .env file"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(anyhow::anyhow!("read .env file: {e}")),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key/value source; `load` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required =
            |key: &str| value(key).ok_or_else(|| anyhow::anyhow!("{key} is required"));

        let cfg = Self {
            telegram: TelegramConfig {
                bot_token: required(ENV_TELEGRAM_BOT_TOKEN)?,
            },
            classifier: BackendConfig {
                name: "classifier".to_string(),
                url: parse_url(ENV_BACKEND_A_URL, &required(ENV_BACKEND_A_URL)?)?,
                token: required(ENV_BACKEND_A_TOKEN)?,
            },
            escalation: BackendConfig {
                name: "escalation".to_string(),
                url: parse_url(ENV_BACKEND_B_URL, &required(ENV_BACKEND_B_URL)?)?,
                token: required(ENV_BACKEND_B_TOKEN)?,
            },
            router: RouterConfig {
                debounce_seconds: parse_or(
                    ENV_DEBOUNCE_SECONDS,
                    value(ENV_DEBOUNCE_SECONDS),
                    DEFAULT_DEBOUNCE_SECONDS,
                )?,
                backend_timeout_seconds: parse_or(
                    ENV_BACKEND_TIMEOUT_SECONDS,
                    value(ENV_BACKEND_TIMEOUT_SECONDS),
                    DEFAULT_BACKEND_TIMEOUT_SECONDS,
                )?,
            },
            server: ServerConfig {
                port: parse_or(ENV_PORT, value(ENV_PORT), DEFAULT_PORT)?,
                http_timeout_seconds: parse_or(
                    ENV_HTTP_TIMEOUT_SECONDS,
                    value(ENV_HTTP_TIMEOUT_SECONDS),
                    DEFAULT_HTTP_TIMEOUT_SECONDS,
                )?,
                http_max_in_flight: parse_or(
                    ENV_HTTP_MAX_IN_FLIGHT,
                    value(ENV_HTTP_MAX_IN_FLIGHT),
                    DEFAULT_HTTP_MAX_IN_FLIGHT,
                )?,
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("{ENV_PORT} must be > 0"));
        }
        if self.router.debounce_seconds == 0 {
            return Err(anyhow::anyhow!("{ENV_DEBOUNCE_SECONDS} must be > 0"));
        }
        if self.router.backend_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("{ENV_BACKEND_TIMEOUT_SECONDS} must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("{ENV_HTTP_TIMEOUT_SECONDS} must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("{ENV_HTTP_MAX_IN_FLIGHT} must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.server.port))
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.router.debounce_seconds)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.router.backend_timeout_seconds)
    }
}

fn parse_url(key: &str, raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("{key} is not a valid url: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow::anyhow!(
            "{key} must use http or https, got {:?}",
            url.scheme()
        ));
    }
    Ok(url)
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw:?} is invalid: {e}")),
        None => Ok(default),
    }
}
