//! Listener configuration.
//!
//! Values can come from serde (any format the caller likes) or from the
//! `HTTP_*` environment variables through [`ServerConfig::from_env`].

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_SHUTDOWN_DELAY_MS: u64 = 2_000;
const DEFAULT_BODY_LIMIT: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub address: IpAddr,
    /// Idle timeout of a connection, also the grace period of a forced shutdown.
    /// `0` disables the idle timeout and makes the forced shutdown immediate.
    pub socket_timeout_ms: u64,
    /// How long `stop()` keeps serving before it starts closing anything.
    pub shutdown_delay_ms: u64,
    /// Largest request body `read_request_body` will buffer, in bytes.
    pub body_limit: usize,
    pub tls: TlsConfig,
}

/// PEM material for the TLS listener. TLS is on when both `cert` and `key` are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
    /// rustls suite names, separated by `:` or `,`.
    pub ciphers: Option<String>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            socket_timeout_ms: DEFAULT_SOCKET_TIMEOUT_MS,
            shutdown_delay_ms: DEFAULT_SHUTDOWN_DELAY_MS,
            body_limit: DEFAULT_BODY_LIMIT,
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, which maps a variable name to its value.
    /// Missing or empty variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let body_limit = match get("HTTP_BODY_LIMIT") {
            Some(_) => parse(&get, "HTTP_BODY_LIMIT", defaults.body_limit)?,
            None => parse(&get, "HTTP_REQUEST_BODY_LIMIT_BYTES", defaults.body_limit)?,
        };

        Ok(Self {
            port: parse(&get, "HTTP_PORT", defaults.port)?,
            address: parse(&get, "HTTP_ADDRESS", defaults.address)?,
            socket_timeout_ms: parse(&get, "HTTP_TIMEOUT", defaults.socket_timeout_ms)?,
            shutdown_delay_ms: parse(&get, "HTTP_SHUTDOWN_DELAY", defaults.shutdown_delay_ms)?,
            body_limit,
            tls: TlsConfig {
                cert: get("HTTP_TLS_CERT"),
                key: get("HTTP_TLS_KEY"),
                ca: get("HTTP_TLS_CA"),
                ciphers: get("HTTP_TLS_CIPHERS"),
            },
        })
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout_ms = duration_millis(timeout);
        self
    }

    #[must_use]
    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay_ms = duration_millis(delay);
        self
    }

    #[must_use]
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// The idle timeout, `None` when it is disabled.
    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout_ms > 0).then(|| Duration::from_millis(self.socket_timeout_ms))
    }

    /// How long `stop()` waits for connections before aborting them.
    pub fn force_close_grace(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Parse { key, value, error: e.to_string() }),
        None => Ok(default),
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
