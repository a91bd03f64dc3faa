//! Runner-wide settings, read from the environment.

use crate::error::{McpError, Result};
use crate::models::DEFAULT_TIMEOUT;
use std::time::Duration;

/// Credential for the E2B sandbox service. Its presence also gates integration tests.
pub const API_KEY_ENV: &str = "E2B_API_KEY";
pub const MAX_SESSIONS_ENV: &str = "E2B_MCP_MAX_SESSIONS";
pub const DEFAULT_TIMEOUT_ENV: &str = "E2B_MCP_DEFAULT_TIMEOUT_SECS";

pub const DEFAULT_MAX_SESSIONS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub api_key: Option<String>,
    pub max_sessions: usize,
    /// Timeout for servers registered without an explicit one.
    pub default_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RunnerConfig {
    /// Loads settings from the process environment, after a `.env` file if one exists.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let max_sessions = match get(MAX_SESSIONS_ENV) {
            Some(raw) => parse_positive(MAX_SESSIONS_ENV, &raw)? as usize,
            None => defaults.max_sessions,
        };
        let default_timeout = match get(DEFAULT_TIMEOUT_ENV) {
            Some(raw) => Duration::from_secs(parse_positive(DEFAULT_TIMEOUT_ENV, &raw)?),
            None => defaults.default_timeout,
        };

        Ok(Self {
            api_key: get(API_KEY_ENV),
            max_sessions,
            default_timeout,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(McpError::InvalidConfig("max_sessions must be at least 1".into()));
        }
        if self.default_timeout.is_zero() {
            return Err(McpError::InvalidConfig("default_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(McpError::InvalidConfig(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}
