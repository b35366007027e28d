//! Environment configuration
//!
//! All secrets and endpoints are resolved once at startup. A missing
//! required secret is a ConfigurationError surfaced before any external
//! call is attempted.

use crate::error::ChatError;
use crate::Result;
use std::env;

pub const DEFAULT_RPC_URL: &str = "https://spicy-rpc.chiliz.com";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Hosted model provider key.
    pub gemini_api_key: String,
    /// Signing key for the on-chain agent wallet.
    pub private_key: String,
    /// JSON-RPC endpoint for blockchain reads/writes.
    pub rpc_url: String,
    /// Postgres connection string; in-memory store when absent.
    pub database_url: Option<String>,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let gemini_api_key = require("GEMINI_API_KEY")?;
        let private_key = require("PRIVATE_KEY")?;

        let rpc_url =
            env::var("CHILIZ_RPC_URL").unwrap_or_else(|_| DEFAULT_RPC_URL.to_string());

        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("POSTGRES_URL"))
            .ok();

        let port = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Ok(Self {
            gemini_api_key,
            private_key,
            rpc_url,
            database_url,
            port,
        })
    }
}

fn require(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ChatError::Configuration(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_rejects_empty() {
        env::set_var("FVO_TEST_EMPTY", "  ");
        assert!(require("FVO_TEST_EMPTY").is_err());
        env::remove_var("FVO_TEST_EMPTY");
        assert!(require("FVO_TEST_EMPTY").is_err());
    }

    #[test]
    fn test_require_accepts_value() {
        env::set_var("FVO_TEST_SET", "abc");
        assert_eq!(require("FVO_TEST_SET").unwrap(), "abc");
        env::remove_var("FVO_TEST_SET");
    }
}
