//! Configuration for the PromptPay bridge server.

use clap::Parser;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::types::Token;

/// CLI arguments for the bridge server.
#[derive(Parser, Debug)]
#[command(name = "promptpay-bridge")]
#[command(about = "PromptPay-to-crypto payment bridge")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

// ============================================================================
// Environment Variable Resolution
// ============================================================================

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"http://localhost:8083"`
/// - Simple env var: `"$EXCHANGE_API_URL"`
/// - Braced env var: `"${EXCHANGE_API_URL}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if s.starts_with("${") && s.ends_with('}') {
            Some(s[2..s.len() - 1].to_string())
        } else if s.starts_with('$') && s.len() > 1 {
            let var_name = &s[1..];
            if var_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(var_name.to_string())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for LiteralOrEnv<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable '{var_name}' not found (referenced as '{s}')"
                ))
            })?
        } else {
            s
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

// ============================================================================
// Config
// ============================================================================

/// Server configuration per §3. Fields use serde defaults that fall back to
/// environment variables, then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_demo_mode")]
    demo_mode: bool,
    #[serde(default = "config_defaults::default_token")]
    default_token: Token,
    #[serde(default = "config_defaults::default_max_amount_thb")]
    max_amount_thb: Decimal,
    #[serde(default = "config_defaults::default_offline_queue_enabled")]
    offline_queue_enabled: bool,
    #[serde(default)]
    exchange_api_url: Option<LiteralOrEnv<Url>>,
    #[serde(default)]
    settlement_api_url: Option<LiteralOrEnv<Url>>,
    #[serde(default)]
    rpc_url: Option<LiteralOrEnv<Url>>,
    #[serde(default)]
    collection_address: Option<LiteralOrEnv<alloy_primitives::Address>>,
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default = "config_defaults::default_database_url")]
    database_url: String,
    #[serde(default)]
    eip712_verifying_contract: Option<LiteralOrEnv<alloy_primitives::Address>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            demo_mode: config_defaults::default_demo_mode(),
            default_token: config_defaults::default_token(),
            max_amount_thb: config_defaults::default_max_amount_thb(),
            offline_queue_enabled: config_defaults::default_offline_queue_enabled(),
            exchange_api_url: None,
            settlement_api_url: None,
            rpc_url: None,
            collection_address: None,
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            database_url: config_defaults::default_database_url(),
            eip712_verifying_contract: None,
        }
    }
}

pub mod config_defaults {
    use super::Token;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_MAX_AMOUNT_THB: Decimal = dec!(10000);

    pub fn default_demo_mode() -> bool {
        env::var("DEMO_MODE").ok().and_then(|s| s.parse().ok()).unwrap_or(true)
    }

    pub fn default_token() -> Token {
        Token::Usdt
    }

    pub fn default_max_amount_thb() -> Decimal {
        DEFAULT_MAX_AMOUNT_THB
    }

    pub fn default_offline_queue_enabled() -> bool {
        true
    }

    /// `$PORT` env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT)
    }

    /// `$HOST` env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }

    /// `$DATABASE_URL` env var -> a WAL-mode file under ./data
    pub fn default_database_url() -> String {
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/promptpay-bridge.db".to_string())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    pub fn demo_mode(&self) -> bool {
        self.demo_mode
    }

    pub fn default_token(&self) -> Token {
        self.default_token
    }

    pub fn max_amount_thb(&self) -> Decimal {
        self.max_amount_thb
    }

    pub fn offline_queue_enabled(&self) -> bool {
        self.offline_queue_enabled
    }

    pub fn exchange_api_url(&self) -> Option<&Url> {
        self.exchange_api_url.as_ref().map(LiteralOrEnv::inner)
    }

    pub fn settlement_api_url(&self) -> Option<&Url> {
        self.settlement_api_url.as_ref().map(LiteralOrEnv::inner)
    }

    pub fn rpc_url(&self) -> Option<&Url> {
        self.rpc_url.as_ref().map(LiteralOrEnv::inner)
    }

    pub fn collection_address(&self) -> Option<alloy_primitives::Address> {
        self.collection_address.as_ref().map(|a| *a.inner())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn eip712_verifying_contract(&self) -> Option<alloy_primitives::Address> {
        self.eip712_verifying_contract.as_ref().map(|a| *a.inner())
    }

    /// Loads configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by `--config <path>` (or `$CONFIG`),
    /// defaulting to `./config.json`. A missing file falls back to defaults
    /// resolved entirely from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        match Path::new(&cli_args.config).canonicalize() {
            Ok(path) => Self::load_from_path(path),
            Err(_) => Ok(Config::default()),
        }
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert!(config.demo_mode());
        assert_eq!(config.default_token(), Token::Usdt);
        assert_eq!(config.max_amount_thb(), dec!(10000));
        assert!(config.offline_queue_enabled());
        assert_eq!(config.port(), 8080);
    }

    #[test]
    fn env_var_indirection_resolves_literal_or_env() {
        unsafe {
            std::env::set_var("PROMPTPAY_BRIDGE_TEST_URL", "https://rates.example/v1");
        }
        let value: LiteralOrEnv<Url> = serde_json::from_str("\"$PROMPTPAY_BRIDGE_TEST_URL\"").unwrap();
        assert_eq!(value.inner().as_str(), "https://rates.example/v1");
        unsafe {
            std::env::remove_var("PROMPTPAY_BRIDGE_TEST_URL");
        }
    }

    #[test]
    fn literal_values_parse_without_env_lookup() {
        let value: LiteralOrEnv<Url> = serde_json::from_str("\"https://rates.example/v1\"").unwrap();
        assert_eq!(value.inner().as_str(), "https://rates.example/v1");
    }
}
