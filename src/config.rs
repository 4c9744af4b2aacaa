use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// The shared secret every tunnel header must present. A session whose
/// header carries any other identity is rejected before the backend connect.
#[derive(Deserialize)]
pub struct AuthConfig {
    pub identity: Uuid,
}

#[derive(Deserialize)]
pub struct LimitsConfig {
    /// Cumulative ceiling on bytes relayed backend-to-client per session.
    /// Unset means unlimited.
    pub session_byte_limit: Option<u64>,
    /// Seconds allowed for the backend connect attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds a session may sit with no traffic in either direction before
    /// it is closed. Zero disables the idle check.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            session_byte_limit: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl LimitsConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    300
}

pub fn load_config() -> Result<Config> {
    let content = fs::read_to_string("config.toml").context("Failed to read config.toml file")?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config.toml as valid TOML")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config = parse_config(
            r#"
            [listen]
            ip = "0.0.0.0"
            port = 8080

            [auth]
            identity = "d342d11e-d424-4f2c-a80f-73287e133d71"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port, 8080);
        assert!(config.listen.tls.is_none());
        assert_eq!(config.limits.session_byte_limit, None);
        assert_eq!(config.limits.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.limits.idle_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn zero_idle_timeout_disables_the_check() {
        let config = parse_config(
            r#"
            [listen]
            ip = "127.0.0.1"
            port = 443

            [listen.tls]
            cert_file = "cert.pem"
            key_file = "key.pem"

            [auth]
            identity = "d342d11e-d424-4f2c-a80f-73287e133d71"

            [limits]
            session_byte_limit = 5242880
            idle_timeout_secs = 0
            "#,
        )
        .unwrap();

        assert!(config.listen.tls.is_some());
        assert_eq!(config.limits.session_byte_limit, Some(5 * 1024 * 1024));
        assert_eq!(config.limits.idle_timeout(), None);
    }

    #[test]
    fn rejects_malformed_identity() {
        let result = parse_config(
            r#"
            [listen]
            ip = "0.0.0.0"
            port = 8080

            [auth]
            identity = "not-a-uuid"
            "#,
        );
        assert!(result.is_err());
    }
}
