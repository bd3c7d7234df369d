// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Orchestrator configuration.
//!
//! Reads runtime configuration from environment variables:
//!
//! - `LISTEN_ADDRESS`: data-plane bind address (default: 0.0.0.0:7780)
//! - `ADMIN_LISTEN_ADDRESS`: admin HTTP bind address (default: 0.0.0.0:7781)
//! - `ADMIN_TOKEN`: admin credential, required
//! - `HEARTBEAT_INTERVAL_SEC`: interval handed to agents (default: 30)
//! - `HEARTBEAT_GRACE_FACTOR`: missed-heartbeat multiplier (default: 3)
//! - `HANDSHAKE_TIMEOUT_SEC`: first-frame deadline (default: 10)
//! - `DRAIN_TIMEOUT_SEC`: shutdown drain window (default: 30)
//! - `DISPATCH_DEFAULT_DEADLINE_SEC`: synchronous dispatch bound (default: 30)
//! - `STATE_STORE_URL`: `sqlite://<path>`; absent selects the in-memory store
//! - `WIRE_ENCODING`: `binary` (default) or `json`
//! - `LOG_LEVEL`: trace, debug, info, warn, error (default: info)

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use ubp_protocol::{WireEncoding, MAX_FRAME_LEN};

pub const ENV_LISTEN_ADDRESS: &str = "LISTEN_ADDRESS";
pub const ENV_ADMIN_LISTEN_ADDRESS: &str = "ADMIN_LISTEN_ADDRESS";
pub const ENV_ADMIN_TOKEN: &str = "ADMIN_TOKEN";
pub const ENV_HEARTBEAT_INTERVAL_SEC: &str = "HEARTBEAT_INTERVAL_SEC";
pub const ENV_HEARTBEAT_GRACE_FACTOR: &str = "HEARTBEAT_GRACE_FACTOR";
pub const ENV_HANDSHAKE_TIMEOUT_SEC: &str = "HANDSHAKE_TIMEOUT_SEC";
pub const ENV_DRAIN_TIMEOUT_SEC: &str = "DRAIN_TIMEOUT_SEC";
pub const ENV_DISPATCH_DEFAULT_DEADLINE_SEC: &str = "DISPATCH_DEFAULT_DEADLINE_SEC";
pub const ENV_STATE_STORE_URL: &str = "STATE_STORE_URL";
pub const ENV_WIRE_ENCODING: &str = "WIRE_ENCODING";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data-plane bind address.
    pub listen_address: SocketAddr,
    /// Admin HTTP bind address.
    pub admin_listen_address: SocketAddr,
    /// Admin credential checked on every `/v1` call.
    pub admin_token: String,
    /// Heartbeat interval handed to agents at handshake.
    pub heartbeat_interval_secs: u32,
    /// A session is dead once `grace_factor * interval` passes without a
    /// heartbeat.
    pub heartbeat_grace_factor: u32,
    pub handshake_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub dispatch_default_deadline_secs: u64,
    pub state_store_url: Option<String>,
    pub wire_encoding: WireEncoding,
    pub max_frame_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7780".parse().expect("static address"),
            admin_listen_address: "0.0.0.0:7781".parse().expect("static address"),
            admin_token: String::new(),
            heartbeat_interval_secs: 30,
            heartbeat_grace_factor: 3,
            handshake_timeout_secs: 10,
            drain_timeout_secs: 30,
            dispatch_default_deadline_secs: 30,
            state_store_url: None,
            wire_encoding: WireEncoding::Binary,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = read_var(ENV_LISTEN_ADDRESS) {
            config.listen_address = parse_var(ENV_LISTEN_ADDRESS, &addr)?;
        }
        if let Some(addr) = read_var(ENV_ADMIN_LISTEN_ADDRESS) {
            config.admin_listen_address = parse_var(ENV_ADMIN_LISTEN_ADDRESS, &addr)?;
        }
        config.admin_token =
            read_var(ENV_ADMIN_TOKEN).ok_or(ConfigError::MissingVar(ENV_ADMIN_TOKEN))?;
        if let Some(v) = read_var(ENV_HEARTBEAT_INTERVAL_SEC) {
            config.heartbeat_interval_secs = parse_var(ENV_HEARTBEAT_INTERVAL_SEC, &v)?;
        }
        if let Some(v) = read_var(ENV_HEARTBEAT_GRACE_FACTOR) {
            config.heartbeat_grace_factor = parse_var(ENV_HEARTBEAT_GRACE_FACTOR, &v)?;
        }
        if let Some(v) = read_var(ENV_HANDSHAKE_TIMEOUT_SEC) {
            config.handshake_timeout_secs = parse_var(ENV_HANDSHAKE_TIMEOUT_SEC, &v)?;
        }
        if let Some(v) = read_var(ENV_DRAIN_TIMEOUT_SEC) {
            config.drain_timeout_secs = parse_var(ENV_DRAIN_TIMEOUT_SEC, &v)?;
        }
        if let Some(v) = read_var(ENV_DISPATCH_DEFAULT_DEADLINE_SEC) {
            config.dispatch_default_deadline_secs =
                parse_var(ENV_DISPATCH_DEFAULT_DEADLINE_SEC, &v)?;
        }
        config.state_store_url = read_var(ENV_STATE_STORE_URL);
        if let Some(v) = read_var(ENV_WIRE_ENCODING) {
            config.wire_encoding = v
                .parse()
                .map_err(|e: String| ConfigError::InvalidValue(ENV_WIRE_ENCODING, e))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_token.is_empty() {
            return Err(ConfigError::MissingVar(ENV_ADMIN_TOKEN));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                ENV_HEARTBEAT_INTERVAL_SEC,
                "must be greater than 0".into(),
            ));
        }
        if self.heartbeat_grace_factor == 0 {
            return Err(ConfigError::InvalidValue(
                ENV_HEARTBEAT_GRACE_FACTOR,
                "must be greater than 0".into(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                ENV_HANDSHAKE_TIMEOUT_SEC,
                "must be greater than 0".into(),
            ));
        }
        // Port 0 means "pick one", so only fixed ports can collide.
        if self.listen_address.port() != 0 && self.listen_address == self.admin_listen_address {
            return Err(ConfigError::InvalidValue(
                ENV_ADMIN_LISTEN_ADDRESS,
                "must differ from the data-plane address".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_interval_secs))
    }

    /// The window after which a silent session is considered gone.
    pub fn heartbeat_grace(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_grace_factor
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.dispatch_default_deadline_secs)
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(name, e.to_string()))
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    MissingVar(&'static str),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingVar(name) => write!(f, "missing required variable: {}", name),
            Self::InvalidValue(name, msg) => write!(f, "invalid value for {}: {}", name, msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            admin_token: "secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = test_config();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.heartbeat_grace_factor, 3);
        assert_eq!(config.heartbeat_grace(), Duration::from_secs(90));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_admin_token() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingVar(ENV_ADMIN_TOKEN))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config {
            heartbeat_interval_secs: 0,
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_colliding_addresses_rejected() {
        let config = Config {
            admin_listen_address: "0.0.0.0:7780".parse().unwrap(),
            ..test_config()
        };
        assert!(config.validate().is_err());
    }
}
